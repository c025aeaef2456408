use serde::{Deserialize, Serialize};
use std::fmt;

use crate::table::EntryHandle;
use crate::types::{BackendId, FdwXactKey, Lsn, Oid};

/// Lifecycle of a foreign transaction entry.
///
/// Transitions only move forward. `Initial` is what a freed slot is reset to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdwXactStatus {
    Initial,
    /// Durably logged; the remote prepare may or may not have happened.
    Preparing,
    /// The remote transaction is durably prepared.
    Prepared,
    /// Decided: commit the prepared remote transaction.
    CommittingPrepared,
    /// Decided: roll back the prepared remote transaction.
    AbortingPrepared,
}

impl fmt::Display for FdwXactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FdwXactStatus::Initial => "initial",
            FdwXactStatus::Preparing => "preparing",
            FdwXactStatus::Prepared => "prepared",
            FdwXactStatus::CommittingPrepared => "committing",
            FdwXactStatus::AbortingPrepared => "aborting",
        };
        f.write_str(s)
    }
}

/// One (local transaction, foreign server, user) triple that is prepared or
/// being prepared.
#[derive(Debug, Clone)]
pub struct FdwXactEntry {
    pub key: FdwXactKey,
    pub user_mapping_id: Oid,
    pub status: FdwXactStatus,
    /// Backend responsible for resolving the entry. `None` makes it a
    /// dangling transaction for background resolution.
    pub held_by: Option<BackendId>,
    pub fdwxact_id: String,
    /// WAL positions of the INSERT record that created the entry. Cleared
    /// once the payload is in its own file.
    pub insert_start_lsn: Lsn,
    pub insert_end_lsn: Lsn,
    /// Set once the INSERT record is flushed. Not checkpointed before that.
    pub valid: bool,
    pub on_disk: bool,
    /// Rebuilt from WAL replay and not yet revalidated.
    pub in_redo: bool,
    pub next_in_chain: Option<EntryHandle>,
}

impl FdwXactEntry {
    pub fn new(key: FdwXactKey, user_mapping_id: Oid, fdwxact_id: String) -> Self {
        Self {
            key,
            user_mapping_id,
            status: FdwXactStatus::Initial,
            held_by: None,
            fdwxact_id,
            insert_start_lsn: Lsn::INVALID,
            insert_end_lsn: Lsn::INVALID,
            valid: false,
            on_disk: false,
            in_redo: false,
            next_in_chain: None,
        }
    }
}
