use log::debug;
use std::any::Any;
use std::sync::Arc;

use crate::driver::{DriverRegistry, FdwXactState, ForeignDriver};
use crate::errors::{FdwXactError, Result};
use crate::table::EntryHandle;
use crate::types::Oid;

/// A foreign server touched by the running local transaction.
pub struct FdwXactParticipant {
    pub server_id: Oid,
    pub user_id: Oid,
    pub user_mapping_id: Oid,
    /// The transaction wrote data on this server.
    pub modified: bool,
    /// Assumed true until the commit policy engine asks the driver.
    pub two_phase_capable: bool,
    /// Assigned when preparation starts.
    pub fdwxact_id: Option<String>,
    /// Back-reference to the table entry once one is inserted. Never owning.
    pub entry: Option<EntryHandle>,
    pub(crate) fdw_state: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) driver: Arc<dyn ForeignDriver>,
}

impl FdwXactParticipant {
    pub(crate) fn state(&self) -> FdwXactState {
        FdwXactState {
            server_id: self.server_id,
            user_id: self.user_id,
            user_mapping_id: self.user_mapping_id,
            fdwxact_id: self.fdwxact_id.clone(),
            fdw_state: self.fdw_state.clone(),
        }
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }
}

/// Foreign servers of one local transaction, in registration order.
///
/// Owned by a single session; no locking.
#[derive(Default)]
pub struct ParticipantList {
    participants: Vec<FdwXactParticipant>,
    /// A modified server can never be prepared, either because its driver
    /// does not manage transactions or because it is not two-phase capable.
    pub(crate) has_nonprepared_write: bool,
}

impl ParticipantList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the transaction touched `server_id` as `user_id`.
    ///
    /// Registering the same pair again only merges the `modified` flag.
    pub fn register(
        &mut self,
        drivers: &DriverRegistry,
        server_id: Oid,
        user_id: Oid,
        modified: bool,
    ) -> Result<()> {
        let server = drivers.lookup(server_id)?;
        let caps = server.driver.capabilities();

        if !caps.transaction_management {
            if modified {
                self.has_nonprepared_write = true;
            }
            return Ok(());
        }

        if let Some(existing) = self
            .participants
            .iter_mut()
            .find(|p| p.server_id == server_id && p.user_id == user_id)
        {
            existing.modified |= modified;
            return Ok(());
        }

        let missing = if !caps.prepare {
            Some("prepare")
        } else if !caps.commit {
            Some("commit")
        } else if !caps.rollback {
            Some("rollback")
        } else {
            None
        };
        if let Some(callback) = missing {
            return Err(FdwXactError::MissingCallback {
                callback,
                driver: server.driver.name().to_string(),
            });
        }

        debug!(
            "Registered foreign server {} user {} (modified: {})",
            server_id, user_id, modified
        );
        self.participants.push(FdwXactParticipant {
            server_id,
            user_id,
            user_mapping_id: drivers.user_mapping_id(server_id, user_id),
            modified,
            two_phase_capable: true,
            fdwxact_id: None,
            entry: None,
            fdw_state: None,
            driver: server.driver,
        });
        Ok(())
    }

    /// Attaches driver-private state to a registered participant.
    pub fn attach_fdw_state(
        &mut self,
        server_id: Oid,
        user_id: Oid,
        state: Arc<dyn Any + Send + Sync>,
    ) -> bool {
        match self
            .participants
            .iter_mut()
            .find(|p| p.server_id == server_id && p.user_id == user_id)
        {
            Some(p) => {
                p.fdw_state = Some(state);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FdwXactParticipant> {
        self.participants.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut FdwXactParticipant> {
        self.participants.iter_mut()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&FdwXactParticipant> {
        self.participants.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut FdwXactParticipant> {
        self.participants.get_mut(index)
    }

    pub(crate) fn remove(&mut self, index: usize) -> FdwXactParticipant {
        self.participants.remove(index)
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.has_nonprepared_write = false;
    }
}
