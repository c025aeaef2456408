use log::debug;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::config::FdwXactConfig;
use crate::driver::DriverRegistry;
use crate::errors::Result;
use crate::local_xact::LocalXactOracle;
use crate::resolver::pool::ResolverPool;
use crate::resolver::queue::WaitQueues;
use crate::session::FdwXactSession;
use crate::storage::state_file;
use crate::storage::{WalRecord, XactLog};
use crate::table::{EntryHandle, FdwXactTable};
use crate::types::{BackendId, Oid, TransactionId};

const NO_XMIN: u64 = u64::MAX;

/// Everything guarded by the table lock.
pub(crate) struct ControlData {
    pub(crate) table: FdwXactTable,
    pub(crate) queues: WaitQueues,
}

/// Shared state behind every session, resolver worker and the manager.
pub(crate) struct Inner {
    pub(crate) config: FdwXactConfig,
    pub(crate) control: RwLock<ControlData>,
    /// Held shared from the insert of an entry until it is valid, and
    /// exclusively by a checkpoint, so a checkpoint never files a half
    /// written entry.
    pub(crate) checkpoint_interlock: RwLock<()>,
    pub(crate) wal: Arc<dyn XactLog>,
    pub(crate) oracle: Arc<dyn LocalXactOracle>,
    pub(crate) drivers: Arc<DriverRegistry>,
    pub(crate) state_dir: PathBuf,
    pub(crate) pool: ResolverPool,
    xmin: AtomicU64,
    wakeups: AtomicUsize,
    next_backend_id: AtomicU32,
}

impl Inner {
    pub(crate) fn allocate_backend_id(&self) -> BackendId {
        self.next_backend_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Requests a resolver for `database_id`, starting one if needed.
    pub(crate) fn wake_resolver(self: &Arc<Self>, database_id: Oid) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
        if self.config.autostart_resolvers {
            self.pool.wake(self, database_id);
        }
    }

    /// Logs the removal of `handle`, deletes its state file and frees its slot.
    pub(crate) fn remove_entry(&self, table: &mut FdwXactTable, handle: EntryHandle) -> Result<()> {
        let Some(entry) = table.get(handle) else {
            return Ok(());
        };
        let key = entry.key;
        let on_disk = entry.on_disk;

        let range = self.wal.append(&WalRecord::Remove(key))?;
        self.wal.flush(range.end)?;
        if on_disk {
            state_file::remove_state_file(&self.state_dir, &key, true)?;
        }
        table.remove(handle);
        Ok(())
    }

    /// Hands every entry owned by `backend_id` over to the resolvers.
    pub(crate) fn release_backend(&self, backend_id: BackendId) -> usize {
        let mut control = self.control.write();
        let mut released = 0;
        for (_, entry) in control.table.iter_mut() {
            if entry.held_by == Some(backend_id) {
                entry.held_by = None;
                released += 1;
            }
        }
        if released > 0 {
            debug!("Backend {} released {} foreign transactions", backend_id, released);
        }
        self.recompute_xmin(&control.table);
        released
    }

    /// Recomputes the oldest local transaction among unowned entries.
    pub(crate) fn recompute_xmin(&self, table: &FdwXactTable) {
        let xmin = table
            .iter()
            .filter(|(_, e)| e.held_by.is_none())
            .map(|(_, e)| e.key.xid)
            .min()
            .map_or(NO_XMIN, u64::from);
        self.xmin.store(xmin, Ordering::SeqCst);
    }

    pub(crate) fn distributed_xmin(&self) -> Option<TransactionId> {
        match self.xmin.load(Ordering::SeqCst) {
            NO_XMIN => None,
            xid => Some(xid as TransactionId),
        }
    }
}

/// Entry point of the foreign transaction coordinator.
///
/// Owns the shared table, the wait queues and the resolver pool. Each
/// backend gets its own [`FdwXactSession`]; recovery, checkpoint and the
/// administrative functions are called on the manager.
pub struct FdwXactManager {
    pub(crate) inner: Arc<Inner>,
}

impl FdwXactManager {
    /// Creates a coordinator. Fails if the configured commit policy cannot be
    /// used with the configured capacities.
    pub fn new(
        config: FdwXactConfig,
        wal: Arc<dyn XactLog>,
        oracle: Arc<dyn LocalXactOracle>,
        drivers: Arc<DriverRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let state_dir = state_file::state_dir(&config.data_dir);
        let table = FdwXactTable::with_capacity(config.max_prepared_foreign_xacts);
        let inner = Inner {
            control: RwLock::new(ControlData {
                table,
                queues: WaitQueues::default(),
            }),
            checkpoint_interlock: RwLock::new(()),
            wal,
            oracle,
            drivers,
            state_dir,
            pool: ResolverPool::new(),
            xmin: AtomicU64::new(NO_XMIN),
            wakeups: AtomicUsize::new(0),
            next_backend_id: AtomicU32::new(1),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &FdwXactConfig {
        &self.inner.config
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.inner.drivers
    }

    /// Opens a session (one backend) connected to `database_id`.
    pub fn session(&self, database_id: Oid) -> FdwXactSession {
        FdwXactSession::new(Arc::clone(&self.inner), database_id)
    }

    /// Oldest local transaction id among entries that no backend owns, or
    /// `None` when there are no such entries.
    pub fn distributed_xmin(&self) -> Option<TransactionId> {
        self.inner.distributed_xmin()
    }

    /// How many times a resolver was asked to run.
    pub fn resolver_wakeups(&self) -> usize {
        self.inner.wakeups.load(Ordering::SeqCst)
    }

    /// Number of live resolver workers.
    pub fn running_resolvers(&self) -> usize {
        self.inner.pool.running()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.control.read().table.len()
    }

    pub fn active_waiters(&self) -> usize {
        self.inner.control.read().queues.active_len()
    }

    pub fn retry_waiters(&self) -> usize {
        self.inner.control.read().queues.retry_len()
    }

    /// Resolves the transaction of the first backend of `database_id`
    /// waiting on the active (or retry) queue. Returns false when there is
    /// nobody to serve.
    pub fn resolve_one(&self, database_id: Oid, from_active_queue: bool) -> Result<bool> {
        self.inner.resolve_one(database_id, from_active_queue)
    }

    /// Resolves every unowned entry of `database_id`. Returns how many were
    /// resolved, or the first failure after attempting all of them.
    pub fn resolve_all_dangling(&self, database_id: Oid) -> Result<usize> {
        self.inner.resolve_all_dangling(database_id)
    }
}

impl Drop for FdwXactManager {
    fn drop(&mut self) {
        self.inner.pool.shutdown();
    }
}
