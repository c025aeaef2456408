//! Crash recovery and checkpoint support.
//!
//! After a crash the table is rebuilt in this order: [`prescan`] drops files
//! written by transactions that cannot have committed, [`restore`] loads the
//! remaining files, WAL replay feeds [`redo`] from the last checkpoint's redo
//! position, and [`recover`] revalidates every entry before normal
//! processing resumes.
//!
//! [`prescan`]: FdwXactManager::prescan
//! [`restore`]: FdwXactManager::restore
//! [`redo`]: FdwXactManager::redo
//! [`recover`]: FdwXactManager::recover

use log::{debug, info, warn};

use crate::coordinator::FdwXactManager;
use crate::errors::{FdwXactError, Result};
use crate::storage::state_file;
use crate::storage::{FdwXactOnDiskData, WalRecord};
use crate::table::{EntryHandle, FdwXactEntry, FdwXactStatus};
use crate::types::{FdwXactKey, Lsn, LsnRange, TransactionId};

impl FdwXactManager {
    /// Applies one replayed WAL record.
    pub fn redo(&self, range: LsnRange, record: &WalRecord) -> Result<()> {
        match record {
            WalRecord::Insert(data) => self.redo_add(data, range.start, range.end).map(|_| ()),
            WalRecord::Remove(key) => self.redo_remove(key),
        }
    }

    /// Rebuilds an entry from an INSERT record, or from a state file when
    /// `start` is invalid. An entry that already exists only gets its WAL
    /// positions refreshed.
    pub fn redo_add(&self, data: &FdwXactOnDiskData, start: Lsn, end: Lsn) -> Result<EntryHandle> {
        let mut control = self.inner.control.write();
        if let Some(handle) = control.table.find(&data.key) {
            if start.is_valid() {
                if let Some(entry) = control.table.get_mut(handle) {
                    entry.insert_start_lsn = start;
                    entry.insert_end_lsn = end;
                }
            }
            return Ok(handle);
        }

        let mut entry = FdwXactEntry::new(data.key, data.user_mapping_id, data.fdwxact_id.clone());
        entry.status = FdwXactStatus::Preparing;
        entry.insert_start_lsn = start;
        entry.insert_end_lsn = end;
        entry.in_redo = true;
        entry.valid = false;
        entry.on_disk = !start.is_valid();
        let handle = control.table.insert(entry)?;
        control.table.link(handle);
        debug!("Redo added foreign transaction {}", data.key);
        Ok(handle)
    }

    /// Drops the entry of a REMOVE record. A missing entry is not an error.
    pub fn redo_remove(&self, key: &FdwXactKey) -> Result<()> {
        let mut control = self.inner.control.write();
        let Some(handle) = control.table.find(key) else {
            return Ok(());
        };
        if control.table.get(handle).is_some_and(|e| e.on_disk) {
            state_file::remove_state_file(&self.inner.state_dir, key, false)?;
        }
        control.table.remove(handle);
        debug!("Redo removed foreign transaction {}", key);
        Ok(())
    }

    /// Files every valid entry whose INSERT record ends at or before
    /// `redo_horizon`, reading the payload back from the WAL. Returns the
    /// number of files written.
    ///
    /// The table is scanned under the shared lock and files are written
    /// without it; the exclusive lock is only taken to mark the entries. An
    /// entry removed in between has its new file deleted again.
    pub fn checkpoint(&self, redo_horizon: Lsn) -> Result<usize> {
        let _interlock = self.inner.checkpoint_interlock.write();

        let candidates: Vec<(EntryHandle, FdwXactKey, Lsn)> = self
            .inner
            .control
            .read()
            .table
            .iter()
            .filter(|(_, e)| {
                (e.valid || e.in_redo)
                    && !e.on_disk
                    && e.insert_start_lsn.is_valid()
                    && e.insert_end_lsn <= redo_horizon
            })
            .map(|(h, e)| (h, e.key, e.insert_start_lsn))
            .collect();

        let mut written = Vec::with_capacity(candidates.len());
        for (handle, key, start) in candidates {
            let data = self.inner.wal.read_insert(start)?;
            if data.key != key {
                return Err(FdwXactError::Corrupted(format!(
                    "WAL record at {} describes {} instead of {}",
                    start, data.key, key
                )));
            }
            state_file::write_state_file(&self.inner.state_dir, &data)?;
            written.push((handle, key));
        }

        let mut filed = 0;
        {
            let mut control = self.inner.control.write();
            for (handle, key) in written {
                match control.table.get_mut(handle) {
                    Some(entry) => {
                        entry.on_disk = true;
                        entry.insert_start_lsn = Lsn::INVALID;
                        entry.insert_end_lsn = Lsn::INVALID;
                        filed += 1;
                    }
                    None => state_file::remove_state_file(&self.inner.state_dir, &key, false)?,
                }
            }
        }
        state_file::sync_dir(&self.inner.state_dir)?;

        if filed > 0 {
            info!(
                "{} foreign transaction state files were written for long-running prepared transactions",
                filed
            );
        }
        Ok(filed)
    }

    /// Scans the state files before WAL replay. Files of transactions at or
    /// after `next_xid`, and corrupt files, are deleted. Returns the oldest
    /// transaction id among the files kept.
    pub fn prescan(&self, next_xid: TransactionId) -> Result<Option<TransactionId>> {
        let dir = &self.inner.state_dir;
        let mut oldest: Option<TransactionId> = None;
        for key in state_file::list_state_files(dir)? {
            if key.xid >= next_xid {
                warn!(
                    "removing future foreign transaction state file \"{}\"",
                    state_file::file_name(&key)
                );
                state_file::remove_state_file(dir, &key, true)?;
                continue;
            }
            if let Err(e) = state_file::read_state_file(dir, &key) {
                warn!(
                    "removing corrupt foreign transaction state file \"{}\": {}",
                    state_file::file_name(&key),
                    e
                );
                state_file::remove_state_file(dir, &key, true)?;
                continue;
            }
            oldest = Some(oldest.map_or(key.xid, |o| o.min(key.xid)));
        }
        Ok(oldest)
    }

    /// Loads every state file into the table. Corrupt files are deleted.
    /// Returns the number of entries loaded.
    pub fn restore(&self) -> Result<usize> {
        let dir = &self.inner.state_dir;
        let mut restored = 0;
        for key in state_file::list_state_files(dir)? {
            match state_file::read_state_file(dir, &key) {
                Ok(data) => {
                    self.redo_add(&data, Lsn::INVALID, Lsn::INVALID)?;
                    restored += 1;
                }
                Err(e) => {
                    warn!(
                        "removing corrupt foreign transaction state file \"{}\": {}",
                        state_file::file_name(&key),
                        e
                    );
                    state_file::remove_state_file(dir, &key, true)?;
                }
            }
        }
        if restored > 0 {
            info!("restored {} foreign transactions from disk", restored);
        }
        Ok(restored)
    }

    /// Revalidates every entry once recovery is complete: its payload is read
    /// back from its file or the WAL and must match. Matching entries become
    /// valid and eligible for checkpoint and resolution; the others are
    /// dropped with a warning. Returns the number of valid entries.
    pub fn recover(&self) -> Result<usize> {
        let mut control = self.inner.control.write();
        let entries: Vec<(EntryHandle, FdwXactKey)> =
            control.table.iter().map(|(h, e)| (h, e.key)).collect();

        let mut recovered = 0;
        for (handle, key) in entries {
            let Some(entry) = control.table.get(handle) else {
                continue;
            };
            let fetched = if entry.on_disk {
                state_file::read_state_file(&self.inner.state_dir, &key)
            } else if entry.insert_start_lsn.is_valid() {
                self.inner.wal.read_insert(entry.insert_start_lsn)
            } else {
                Err(FdwXactError::Corrupted(format!(
                    "foreign transaction {} has neither a state file nor a WAL position",
                    key
                )))
            };
            let fetched = fetched.and_then(|data| {
                if data.key == key && data.fdwxact_id == entry.fdwxact_id {
                    Ok(data)
                } else {
                    Err(FdwXactError::Corrupted(format!(
                        "stored data does not match foreign transaction {}",
                        key
                    )))
                }
            });

            match fetched {
                Ok(_) => {
                    if let Some(entry) = control.table.get_mut(handle) {
                        entry.in_redo = false;
                        entry.valid = true;
                    }
                    recovered += 1;
                }
                Err(e) => {
                    warn!("removing foreign transaction {}: {}", key, e);
                    if control.table.get(handle).is_some_and(|e| e.on_disk) {
                        state_file::remove_state_file(&self.inner.state_dir, &key, false)?;
                    }
                    control.table.remove(handle);
                }
            }
        }
        self.inner.recompute_xmin(&control.table);

        if recovered > 0 {
            info!("recovered {} prepared foreign transactions", recovered);
        }
        Ok(recovered)
    }
}
