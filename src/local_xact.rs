use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;

use crate::types::TransactionId;

/// Outcome of a local transaction as recorded by the local transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalXactStatus {
    Committed,
    Aborted,
    InProgress,
    /// No trace of the transaction, e.g. it never wrote a commit record
    /// before a crash.
    Unknown,
}

/// Read access to the local transaction manager.
///
/// Resolvers consult it to decide the fate of foreign transactions whose
/// entries do not carry an explicit commit or abort decision.
pub trait LocalXactOracle: Send + Sync {
    fn status(&self, xid: TransactionId) -> LocalXactStatus;

    /// Whether `xid` is a locally prepared (two-phase) transaction. Foreign
    /// transactions of such a transaction must wait for its own outcome.
    fn is_prepared(&self, xid: TransactionId) -> bool;
}

/// An in-memory [`LocalXactOracle`] fed by the embedding transaction manager.
#[derive(Default)]
pub struct XactStatusMap {
    statuses: RwLock<HashMap<TransactionId, LocalXactStatus>>,
    prepared: RwLock<HashSet<TransactionId>>,
}

impl XactStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, xid: TransactionId, status: LocalXactStatus) {
        self.statuses.write().insert(xid, status);
    }

    pub fn set_prepared(&self, xid: TransactionId, prepared: bool) {
        let mut set = self.prepared.write();
        if prepared {
            set.insert(xid);
        } else {
            set.remove(&xid);
        }
    }
}

impl LocalXactOracle for XactStatusMap {
    fn status(&self, xid: TransactionId) -> LocalXactStatus {
        self.statuses
            .read()
            .get(&xid)
            .copied()
            .unwrap_or(LocalXactStatus::Unknown)
    }

    fn is_prepared(&self, xid: TransactionId) -> bool {
        self.prepared.read().contains(&xid)
    }
}
