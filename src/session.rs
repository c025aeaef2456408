//! Per-backend side of the coordinator.
//!
//! A session follows one local transaction at a time through registration,
//! pre-commit (one-phase commits and preparation), post-commit or post-abort
//! processing and the wait for its resolver. The participant list is owned
//! by the session and needs no locking; everything it puts into the shared
//! table goes through the table lock.

use log::{debug, warn};
use rand::Rng;
use std::any::Any;
use std::sync::Arc;

use crate::commit_policy;
use crate::config::CommitPolicy;
use crate::coordinator::Inner;
use crate::errors::{FdwXactError, Result};
use crate::participant::{FdwXactParticipant, ParticipantList};
use crate::resolver::queue::{BackendWaiter, Interrupt, QueuedWaiter};
use crate::storage::{FdwXactOnDiskData, WalRecord};
use crate::table::{EntryHandle, FdwXactEntry, FdwXactStatus};
use crate::types::{BackendId, FDWXACT_ID_MAX_LEN, FdwXactKey, Oid, TransactionId};

/// How a wait for resolution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A resolver finished every foreign transaction.
    Resolved,
    /// The wait was cancelled; resolvers finish the work in the background.
    Cancelled,
    /// The backend is shutting down or lost its supervisor.
    Shutdown,
    /// There was nothing to wait for.
    NotRequired,
}

pub struct FdwXactSession {
    inner: Arc<Inner>,
    database_id: Oid,
    backend_id: BackendId,
    xid: TransactionId,
    wrote_local_data: bool,
    participants: ParticipantList,
    commit_policy: CommitPolicy,
    atomic_commit_requested: bool,
    /// Entries prepared by this session for the running transaction.
    prepared: Vec<EntryHandle>,
    waiter: Arc<BackendWaiter>,
}

impl FdwXactSession {
    pub(crate) fn new(inner: Arc<Inner>, database_id: Oid) -> Self {
        let backend_id = inner.allocate_backend_id();
        let commit_policy = inner.config.commit_policy;
        Self {
            inner,
            database_id,
            backend_id,
            xid: 0,
            wrote_local_data: false,
            participants: ParticipantList::new(),
            commit_policy,
            atomic_commit_requested: false,
            prepared: Vec::new(),
            waiter: Arc::new(BackendWaiter::new(backend_id)),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    pub fn database_id(&self) -> Oid {
        self.database_id
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    pub fn xid(&self) -> TransactionId {
        self.xid
    }

    /// Wake handle of this session, for delivering cancel or shutdown
    /// requests from another thread.
    pub fn waiter(&self) -> Arc<BackendWaiter> {
        Arc::clone(&self.waiter)
    }

    pub fn participants(&self) -> &ParticipantList {
        &self.participants
    }

    pub fn commit_policy(&self) -> CommitPolicy {
        self.commit_policy
    }

    /// Overrides the commit policy for this session.
    pub fn set_commit_policy(&mut self, policy: CommitPolicy) -> Result<()> {
        self.inner.config.check_policy(policy)?;
        self.commit_policy = policy;
        Ok(())
    }

    /// Starts tracking local transaction `xid`. Entries still owned from a
    /// previous transaction are handed over to the resolvers.
    pub fn begin(&mut self, xid: TransactionId) {
        if !self.prepared.is_empty() && self.inner.release_backend(self.backend_id) > 0 {
            self.inner.wake_resolver(self.database_id);
        }
        self.forget_transaction();
        self.xid = xid;
    }

    /// The local transaction modified non-temporary local data.
    pub fn note_local_write(&mut self) {
        self.wrote_local_data = true;
    }

    pub fn register_participant(&mut self, server_id: Oid, user_id: Oid, modified: bool) -> Result<()> {
        self.participants
            .register(&self.inner.drivers, server_id, user_id, modified)
    }

    pub fn attach_fdw_state(
        &mut self,
        server_id: Oid,
        user_id: Oid,
        state: Arc<dyn Any + Send + Sync>,
    ) -> bool {
        self.participants.attach_fdw_state(server_id, user_id, state)
    }

    /// Whether the running transaction must commit its foreign servers
    /// atomically. Queries the drivers for two-phase capability.
    pub fn atomic_commit_required(&mut self) -> bool {
        commit_policy::atomic_commit_required(
            &self.inner.config,
            self.commit_policy,
            &mut self.participants,
            self.wrote_local_data,
        )
    }

    /// Pre-commit processing: commits what can be committed in one phase and
    /// prepares the rest. An error here aborts the local transaction.
    pub fn pre_commit(&mut self) -> Result<()> {
        if self.participants.is_empty() {
            return Ok(());
        }
        let policy = self.commit_policy;
        let required = self.atomic_commit_required();
        commit_policy::check_strict_policy(policy, required, &self.participants)?;

        let mut index = 0;
        while let Some(p) = self.participants.get(index) {
            let commit_now = !required
                || !p.modified
                || (policy == CommitPolicy::Prefer && !p.two_phase_capable);
            if commit_now {
                commit_one_phase(p)?;
                self.participants.remove(index);
            } else {
                index += 1;
            }
        }

        if self.participants.len() == 1 && !self.wrote_local_data {
            if let Some(p) = self.participants.get(0) {
                commit_one_phase(p)?;
            }
            self.participants.remove(0);
            return Ok(());
        }
        if self.participants.is_empty() {
            return Ok(());
        }
        self.prepare_participants()
    }

    /// Prepares the foreign transactions of a transaction that is itself
    /// being prepared locally.
    ///
    /// Read-only participants are committed right away. Afterwards the
    /// entries belong to no backend; resolvers leave them alone for as long
    /// as the local transaction is reported prepared, and a later
    /// [`wait_for_resolution`](Self::wait_for_resolution) with its xid
    /// finishes them.
    pub fn prepare_transaction(&mut self) -> Result<()> {
        if self.participants.is_empty() {
            return Ok(());
        }
        let mut nonprepared = false;
        for p in self.participants.iter_mut() {
            p.two_phase_capable = p.driver.is_two_phase_capable(p.server_id);
            if p.modified && !p.two_phase_capable {
                nonprepared = true;
            }
        }
        if nonprepared || self.participants.has_nonprepared_write {
            self.participants.has_nonprepared_write = true;
            return Err(FdwXactError::CannotCommitDistributed);
        }

        let mut index = 0;
        while let Some(p) = self.participants.get(index) {
            if p.modified {
                index += 1;
            } else {
                commit_one_phase(p)?;
                self.participants.remove(index);
            }
        }
        self.prepare_participants()?;

        self.inner.release_backend(self.backend_id);
        self.forget_transaction();
        Ok(())
    }

    fn prepare_participants(&mut self) -> Result<()> {
        let config = &self.inner.config;
        if config.max_prepared_foreign_xacts == 0 {
            return Err(FdwXactError::CapacityDisabled {
                knob: "max_prepared_foreign_xacts",
            });
        }
        if config.max_foreign_xact_resolvers == 0 {
            return Err(FdwXactError::CapacityDisabled {
                knob: "max_foreign_xact_resolvers",
            });
        }
        self.atomic_commit_requested = true;

        for index in 0..self.participants.len() {
            let Some(p) = self.participants.get_mut(index) else {
                break;
            };
            if p.entry.is_some() {
                continue;
            }
            let fdwxact_id = prepare_id(p, self.xid)?;
            p.fdwxact_id = Some(fdwxact_id.clone());

            let key = FdwXactKey {
                database_id: self.database_id,
                xid: self.xid,
                server_id: p.server_id,
                user_id: p.user_id,
            };
            let handle = insert_entry(&self.inner, key, p.user_mapping_id, fdwxact_id, self.backend_id)?;
            p.entry = Some(handle);
            self.prepared.push(handle);

            let reason = match p.driver.prepare(&p.state()) {
                Ok(true) => None,
                Ok(false) => Some("the foreign server refused to prepare".to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = reason {
                return Err(FdwXactError::RemotePrepareFailed {
                    server_id: p.server_id,
                    user_id: p.user_id,
                    reason,
                });
            }

            let mut control = self.inner.control.write();
            if let Some(entry) = control.table.get_mut(handle) {
                entry.status = FdwXactStatus::Prepared;
            }
            control.table.link(handle);
            debug!("Prepared foreign transaction {} on server {}", key, p.server_id);
        }
        Ok(())
    }

    /// Post-commit or post-abort processing.
    ///
    /// On commit the prepared entries stay owned by this session until
    /// [`wait_for_resolution`](Self::wait_for_resolution). On abort,
    /// participants that were never prepared are rolled back directly and
    /// anything durably prepared is left to the resolvers.
    pub fn finish(&mut self, is_commit: bool) {
        if is_commit {
            self.participants.clear();
            return;
        }

        for index in 0..self.participants.len() {
            let Some(p) = self.participants.get(index) else {
                break;
            };
            let status = p
                .entry
                .and_then(|h| self.inner.control.read().table.get(h).map(|e| e.status));
            match (p.entry, status) {
                (None, _) => {
                    if let Err(e) = p.driver.rollback(&p.state()) {
                        warn!(
                            "could not roll back transaction on server {} for user {}: {}",
                            p.server_id, p.user_id, e
                        );
                    }
                }
                (Some(handle), Some(FdwXactStatus::Preparing)) => {
                    if let Err(e) = p.driver.rollback(&p.state()) {
                        warn!(
                            "could not roll back transaction on server {} for user {}: {}",
                            p.server_id, p.user_id, e
                        );
                        continue;
                    }
                    let mut control = self.inner.control.write();
                    match self.inner.remove_entry(&mut control.table, handle) {
                        Ok(()) => self.prepared.retain(|h| *h != handle),
                        Err(e) => warn!(
                            "could not remove foreign transaction {} after rollback: {}",
                            handle_key(p, self.database_id, self.xid),
                            e
                        ),
                    }
                }
                // Durably prepared remotely; only a resolver may finish it.
                (Some(_), _) => {}
            }
        }

        let orphaned = self.inner.release_backend(self.backend_id);
        if orphaned > 0 {
            warn!(
                "{} foreign transactions are left in doubt and will be resolved by a foreign transaction resolver",
                orphaned
            );
            self.inner.wake_resolver(self.database_id);
        }
        self.forget_transaction();
    }

    /// Waits until a resolver has finished the foreign transactions of
    /// `xid` with the given outcome.
    ///
    /// For the session's own transaction the entries it prepared are used;
    /// for any other xid (a transaction prepared earlier) the table is
    /// scanned. A cancel or shutdown ends the wait early without changing
    /// the local outcome.
    pub fn wait_for_resolution(&mut self, xid: TransactionId, is_commit: bool) -> Result<WaitOutcome> {
        let own_transaction = xid == self.xid;
        if own_transaction && !self.atomic_commit_requested {
            return Ok(WaitOutcome::NotRequired);
        }
        let candidates = if own_transaction && !self.prepared.is_empty() {
            self.prepared.clone()
        } else {
            self.inner
                .control
                .read()
                .table
                .handles_for_xid(self.database_id, xid)
        };

        let owned = {
            let mut control = self.inner.control.write();
            let mut owned = 0;
            for handle in candidates {
                let Some(entry) = control.table.get_mut(handle) else {
                    continue;
                };
                if entry.held_by.is_some_and(|b| b != self.backend_id) {
                    continue;
                }
                entry.held_by = Some(self.backend_id);
                if entry.status == FdwXactStatus::Prepared {
                    entry.status = if is_commit {
                        FdwXactStatus::CommittingPrepared
                    } else {
                        FdwXactStatus::AbortingPrepared
                    };
                }
                owned += 1;
            }
            if owned > 0 {
                self.waiter.start_waiting();
                control.queues.push_active(QueuedWaiter {
                    database_id: self.database_id,
                    xid,
                    waiter: Arc::clone(&self.waiter),
                });
            }
            owned
        };
        if owned == 0 {
            if own_transaction {
                self.forget_transaction();
            }
            return Ok(WaitOutcome::NotRequired);
        }

        debug!(
            "Backend {} waits for {} foreign transactions of xid {}",
            self.backend_id, owned, xid
        );
        self.inner.wake_resolver(self.database_id);

        let local = if is_commit { "committed" } else { "aborted" };
        let outcome = match self.waiter.wait() {
            Ok(()) => WaitOutcome::Resolved,
            Err(Interrupt::Cancel) => {
                warn!(
                    "canceling wait for resolving foreign transactions on user request; the transaction has already {} locally, but might not have been {} on the foreign servers",
                    local, local
                );
                WaitOutcome::Cancelled
            }
            Err(Interrupt::Shutdown) | Err(Interrupt::SupervisorDied) => {
                warn!(
                    "canceling the wait for resolving foreign transactions and terminating connection due to administrator command; the transaction has already {} locally, but might not have been {} on the foreign servers",
                    local, local
                );
                WaitOutcome::Shutdown
            }
        };

        self.inner.control.write().queues.remove(self.backend_id);
        self.waiter.reset();
        self.inner.release_backend(self.backend_id);
        if own_transaction {
            self.forget_transaction();
        }
        Ok(outcome)
    }

    fn forget_transaction(&mut self) {
        self.participants.clear();
        self.prepared.clear();
        self.wrote_local_data = false;
        self.atomic_commit_requested = false;
    }
}

impl Drop for FdwXactSession {
    fn drop(&mut self) {
        self.inner.control.write().queues.remove(self.backend_id);
        if self.inner.release_backend(self.backend_id) > 0 {
            self.inner.wake_resolver(self.database_id);
        }
    }
}

fn commit_one_phase(p: &FdwXactParticipant) -> Result<()> {
    p.driver
        .commit(&p.state())
        .map_err(|e| FdwXactError::RemoteCommitFailed {
            server_id: p.server_id,
            user_id: p.user_id,
            reason: e.to_string(),
        })?;
    debug!("Committed transaction on server {} user {}", p.server_id, p.user_id);
    Ok(())
}

/// Identifier to prepare the remote transaction under: the driver's if it
/// supplies one, `fx_<random>_<xid>_<server>_<user>` otherwise.
fn prepare_id(p: &FdwXactParticipant, xid: TransactionId) -> Result<String> {
    if p.driver.capabilities().get_prepare_id {
        if let Some(id) = p.driver.get_prepare_id(xid, p.server_id, p.user_id) {
            if id.len() > FDWXACT_ID_MAX_LEN {
                return Err(FdwXactError::IdentifierTooLong {
                    len: id.len(),
                    max: FDWXACT_ID_MAX_LEN,
                });
            }
            return Ok(id);
        }
    }
    let mut id = format!(
        "fx_{}_{}_{}_{}",
        rand::rng().random::<u32>(),
        xid,
        p.server_id,
        p.user_id
    );
    id.truncate(FDWXACT_ID_MAX_LEN);
    Ok(id)
}

/// Inserts a `Preparing` entry and makes its INSERT record durable. The
/// remote prepare must not be issued before this returns.
fn insert_entry(
    inner: &Inner,
    key: FdwXactKey,
    user_mapping_id: Oid,
    fdwxact_id: String,
    backend_id: BackendId,
) -> Result<EntryHandle> {
    let _interlock = inner.checkpoint_interlock.read();
    let mut entry = FdwXactEntry::new(key, user_mapping_id, fdwxact_id);
    entry.status = FdwXactStatus::Preparing;
    entry.held_by = Some(backend_id);
    let data = FdwXactOnDiskData::from(&entry);
    let handle = inner.control.write().table.insert(entry)?;

    let logged = inner
        .wal
        .append(&WalRecord::Insert(data))
        .and_then(|range| inner.wal.flush(range.end).map(|()| range));
    let mut control = inner.control.write();
    match logged {
        Ok(range) => {
            if let Some(entry) = control.table.get_mut(handle) {
                entry.insert_start_lsn = range.start;
                entry.insert_end_lsn = range.end;
                entry.valid = true;
            }
            Ok(handle)
        }
        Err(e) => {
            control.table.remove(handle);
            Err(e)
        }
    }
}

fn handle_key(p: &FdwXactParticipant, database_id: Oid, xid: TransactionId) -> FdwXactKey {
    FdwXactKey {
        database_id,
        xid,
        server_id: p.server_id,
        user_id: p.user_id,
    }
}
