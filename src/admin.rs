use log::{debug, info};

use crate::coordinator::FdwXactManager;
use crate::errors::{FdwXactError, Result};
use crate::resolver::EntrySnapshot;
use crate::session::FdwXactSession;
use crate::table::FdwXactStatus;
use crate::types::{FdwXactKey, Oid, TransactionId};

/// One row of the foreign transaction listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdwXactStatusRow {
    pub database_id: Oid,
    pub xid: TransactionId,
    pub server_id: Oid,
    pub user_id: Oid,
    pub status: FdwXactStatus,
    pub identifier: String,
}

impl FdwXactManager {
    /// Lists every entry of the table, ordered by key.
    pub fn list_foreign_xacts(&self) -> Vec<FdwXactStatusRow> {
        let control = self.inner.control.read();
        let mut rows: Vec<FdwXactStatusRow> = control
            .table
            .iter()
            .map(|(_, e)| FdwXactStatusRow {
                database_id: e.key.database_id,
                xid: e.key.xid,
                server_id: e.key.server_id,
                user_id: e.key.user_id,
                status: e.status,
                identifier: e.fdwxact_id.clone(),
            })
            .collect();
        rows.sort_by_key(|r| (r.database_id, r.xid, r.server_id, r.user_id));
        rows
    }
}

impl FdwXactSession {
    /// Resolves one foreign transaction of this session's database by hand.
    pub fn resolve_foreign_xact(
        &self,
        xid: TransactionId,
        server_id: Oid,
        user_id: Oid,
        superuser: bool,
    ) -> Result<()> {
        if !superuser {
            return Err(FdwXactError::PermissionDenied("resolve foreign transactions"));
        }
        let key = self.admin_key(xid, server_id, user_id);
        let inner = self.inner();
        let snapshot = {
            let mut control = inner.control.write();
            let handle = control
                .table
                .find(&key)
                .ok_or(FdwXactError::EntryNotFound(key))?;
            let entry = control
                .table
                .get_mut(handle)
                .ok_or(FdwXactError::EntryNotFound(key))?;
            if let Some(backend) = entry.held_by {
                return Err(FdwXactError::EntryBusy { key, backend });
            }
            entry.held_by = Some(self.backend_id());
            EntrySnapshot::new(handle, entry)
        };

        let result = inner.resolve(&snapshot);
        if result.is_err() {
            if let Some(entry) = inner.control.write().table.get_mut(snapshot.handle) {
                entry.held_by = None;
            }
        }
        inner.recompute_xmin(&inner.control.read().table);
        result?;
        info!("foreign transaction {} was resolved manually", key);
        Ok(())
    }

    /// Forgets one foreign transaction without contacting its server, for
    /// servers that are gone for good.
    pub fn remove_foreign_xact(
        &self,
        xid: TransactionId,
        server_id: Oid,
        user_id: Oid,
        superuser: bool,
    ) -> Result<()> {
        if !superuser {
            return Err(FdwXactError::PermissionDenied("remove foreign transactions"));
        }
        let key = self.admin_key(xid, server_id, user_id);
        let inner = self.inner();
        let mut control = inner.control.write();
        let handle = control
            .table
            .find(&key)
            .ok_or(FdwXactError::EntryNotFound(key))?;
        if let Some(backend) = control.table.get(handle).and_then(|e| e.held_by) {
            return Err(FdwXactError::EntryBusy { key, backend });
        }
        inner.remove_entry(&mut control.table, handle)?;
        inner.recompute_xmin(&control.table);
        debug!("Foreign transaction {} was removed manually", key);
        Ok(())
    }

    fn admin_key(&self, xid: TransactionId, server_id: Oid, user_id: Oid) -> FdwXactKey {
        FdwXactKey {
            database_id: self.database_id(),
            xid,
            server_id,
            user_id,
        }
    }
}
