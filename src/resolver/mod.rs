//! Resolution of prepared foreign transactions.
//!
//! Backends that committed or aborted locally queue themselves and wait; a
//! resolver takes the first waiter of its database, finishes every entry of
//! that backend's transaction on the remote servers and wakes it. A failed
//! attempt parks the waiter on the retry queue. Entries nobody owns anymore
//! are picked up by the dangling sweep.

pub(crate) mod pool;
pub mod queue;

use log::{debug, warn};

use crate::config::FailureSeverity;
use crate::coordinator::Inner;
use crate::driver::FdwXactState;
use crate::errors::{FdwXactError, Result};
use crate::local_xact::LocalXactStatus;
use crate::table::{EntryHandle, FdwXactEntry, FdwXactStatus};
use crate::types::{FdwXactKey, Oid};

/// Copy of the entry fields a resolution needs, taken under the table lock
/// so that remote calls run without it.
#[derive(Debug, Clone)]
pub(crate) struct EntrySnapshot {
    pub(crate) handle: EntryHandle,
    pub(crate) key: FdwXactKey,
    pub(crate) user_mapping_id: Oid,
    pub(crate) status: FdwXactStatus,
    pub(crate) fdwxact_id: String,
}

impl EntrySnapshot {
    pub(crate) fn new(handle: EntryHandle, entry: &FdwXactEntry) -> Self {
        Self {
            handle,
            key: entry.key,
            user_mapping_id: entry.user_mapping_id,
            status: entry.status,
            fdwxact_id: entry.fdwxact_id.clone(),
        }
    }
}

impl Inner {
    /// Resolves the transaction of the first waiter of `database_id`.
    ///
    /// Only entries the waiter still holds are taken. They are claimed for
    /// the duration of the remote calls, so a waiter that detaches meanwhile
    /// cannot hand them to a manual resolve. Unresolved entries go back to
    /// the waiter, or to nobody once it stopped waiting.
    pub(crate) fn resolve_one(&self, database_id: Oid, from_active: bool) -> Result<bool> {
        let claimer = self.allocate_backend_id();
        let (xid, waiter, entries) = {
            let mut control = self.control.write();
            let Some(queued) = control.queues.first_for(database_id, from_active) else {
                return Ok(false);
            };
            let (xid, waiter) = (queued.xid, queued.waiter.clone());
            let backend_id = waiter.backend_id();
            let mut claimed = Vec::new();
            for handle in control.table.handles_for_xid(database_id, xid) {
                if let Some(entry) = control.table.get_mut(handle) {
                    if entry.held_by == Some(backend_id) {
                        entry.held_by = Some(claimer);
                        claimed.push(EntrySnapshot::new(handle, entry));
                    }
                }
            }
            (xid, waiter, claimed)
        };
        let backend_id = waiter.backend_id();

        for (done, entry) in entries.iter().enumerate() {
            if let Err(e) = self.resolve(entry) {
                let mut control = self.control.write();
                let still_waiting = control.queues.move_to_retry(backend_id, xid);
                if still_waiting {
                    waiter.mark_retry();
                    debug!(
                        "Moved backend {} (xid {}) to the retry queue",
                        backend_id, xid
                    );
                }
                let owner = still_waiting.then_some(backend_id);
                for rest in &entries[done..] {
                    if let Some(claimed) = control.table.get_mut(rest.handle) {
                        if claimed.held_by == Some(claimer) {
                            claimed.held_by = owner;
                        }
                    }
                }
                self.recompute_xmin(&control.table);
                return Err(e);
            }
        }

        let mut control = self.control.write();
        if control.queues.remove_for(backend_id, xid) {
            waiter.complete();
        }
        debug!(
            "Resolved {} foreign transactions of xid {} for backend {}",
            entries.len(),
            xid,
            backend_id
        );
        Ok(true)
    }

    /// Finishes one entry on its remote server and removes it.
    pub(crate) fn resolve(&self, entry: &EntrySnapshot) -> Result<()> {
        let xid = entry.key.xid;
        let is_commit = match entry.status {
            FdwXactStatus::CommittingPrepared => true,
            FdwXactStatus::AbortingPrepared => false,
            _ => match self.oracle.status(xid) {
                LocalXactStatus::Committed => true,
                LocalXactStatus::Aborted | LocalXactStatus::Unknown => false,
                LocalXactStatus::InProgress => {
                    return Err(FdwXactError::TransactionInProgress(xid));
                }
            },
        };

        let server = self.drivers.lookup(entry.key.server_id)?;
        if !server.driver.capabilities().resolve {
            return Err(FdwXactError::MissingCallback {
                callback: "resolve",
                driver: server.driver.name().to_string(),
            });
        }
        let state = FdwXactState {
            server_id: entry.key.server_id,
            user_id: entry.key.user_id,
            user_mapping_id: entry.user_mapping_id,
            fdwxact_id: Some(entry.fdwxact_id.clone()),
            fdw_state: None,
        };
        if let Err(e) = server.driver.resolve(&state, is_commit) {
            match self.config.resolution_failure {
                FailureSeverity::Error => {
                    return Err(FdwXactError::RemoteResolveFailed {
                        server_id: entry.key.server_id,
                        user_id: entry.key.user_id,
                        reason: e.to_string(),
                    });
                }
                FailureSeverity::Warning => {
                    warn!(
                        "could not resolve foreign transaction \"{}\" on server {}: {}",
                        entry.fdwxact_id, entry.key.server_id, e
                    );
                }
            }
        }

        let mut control = self.control.write();
        if control
            .table
            .get(entry.handle)
            .is_some_and(|e| e.key == entry.key)
        {
            self.remove_entry(&mut control.table, entry.handle)?;
        }
        debug!(
            "Foreign transaction {} {}",
            entry.key,
            if is_commit { "committed" } else { "rolled back" }
        );
        Ok(())
    }

    pub(crate) fn resolve_all_dangling(&self, database_id: Oid) -> Result<usize> {
        let claimer = self.allocate_backend_id();
        let entries: Vec<EntrySnapshot> = {
            let mut control = self.control.write();
            let mut claimed = Vec::new();
            for (handle, entry) in control.table.iter_mut() {
                if entry.key.database_id == database_id
                    && entry.held_by.is_none()
                    && entry.valid
                    && !self.oracle.is_prepared(entry.key.xid)
                {
                    entry.held_by = Some(claimer);
                    claimed.push(EntrySnapshot::new(handle, entry));
                }
            }
            claimed
        };

        let mut resolved = 0;
        let mut first_error = None;
        for entry in &entries {
            match self.resolve(entry) {
                Ok(()) => resolved += 1,
                Err(e) => {
                    if let Some(claimed) = self.control.write().table.get_mut(entry.handle) {
                        claimed.held_by = None;
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
        self.recompute_xmin(&self.control.read().table);

        if !entries.is_empty() {
            debug!(
                "Dangling sweep of database {} resolved {} of {} foreign transactions",
                database_id,
                resolved,
                entries.len()
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(resolved),
        }
    }
}
