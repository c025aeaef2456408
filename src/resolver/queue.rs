//! Backend side of the resolver rendezvous: a per-backend wait handle and
//! the two FIFO queues resolvers take work from.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::types::{BackendId, Oid, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    NotWaiting,
    /// Queued on the active queue.
    Waiting,
    /// A resolution attempt failed; queued on the retry queue.
    WaitingRetry,
    /// Every entry of the transaction is resolved.
    WaitComplete,
}

/// Events that stop a backend from waiting for its resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancel,
    Shutdown,
    SupervisorDied,
}

struct WaitSlot {
    state: WaitState,
    interrupt: Option<Interrupt>,
}

/// Wake handle of one backend.
///
/// Shared between the backend, the queues and whoever needs to interrupt the
/// backend (cancel requests, shutdown). State changes made by a resolver
/// happen while the table lock is held.
pub struct BackendWaiter {
    backend_id: BackendId,
    slot: Mutex<WaitSlot>,
    condvar: Condvar,
}

impl BackendWaiter {
    pub fn new(backend_id: BackendId) -> Self {
        Self {
            backend_id,
            slot: Mutex::new(WaitSlot {
                state: WaitState::NotWaiting,
                interrupt: None,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    pub fn state(&self) -> WaitState {
        self.slot.lock().state
    }

    /// Asks the backend to stop waiting. The local commit stands. A cancel
    /// that arrives while the backend is not waiting is dropped.
    pub fn cancel(&self) {
        self.interrupt(Interrupt::Cancel);
    }

    /// Administrative shutdown of the backend. Stays pending until the
    /// backend next waits.
    pub fn shutdown(&self) {
        self.interrupt(Interrupt::Shutdown);
    }

    /// The supervising process went away; handled like a shutdown.
    pub fn supervisor_died(&self) {
        self.interrupt(Interrupt::SupervisorDied);
    }

    fn interrupt(&self, interrupt: Interrupt) {
        let mut slot = self.slot.lock();
        if interrupt == Interrupt::Cancel {
            let waiting = matches!(slot.state, WaitState::Waiting | WaitState::WaitingRetry);
            if !waiting || slot.interrupt.is_some() {
                return;
            }
        }
        slot.interrupt = Some(interrupt);
        drop(slot);
        self.condvar.notify_all();
    }

    pub(crate) fn start_waiting(&self) {
        self.slot.lock().state = WaitState::Waiting;
    }

    /// Ends a wait. A cancel that lost the race against `complete` is
    /// discarded with it.
    pub(crate) fn reset(&self) {
        let mut slot = self.slot.lock();
        slot.state = WaitState::NotWaiting;
        if slot.interrupt == Some(Interrupt::Cancel) {
            slot.interrupt = None;
        }
    }

    /// Moves a waiting backend to `WaitingRetry`. Returns false if it was
    /// not waiting on the active queue.
    pub(crate) fn mark_retry(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != WaitState::Waiting {
            return false;
        }
        slot.state = WaitState::WaitingRetry;
        true
    }

    /// Marks the wait complete and wakes the backend, unless it already
    /// stopped waiting.
    pub(crate) fn complete(&self) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(slot.state, WaitState::Waiting | WaitState::WaitingRetry) {
            return false;
        }
        slot.state = WaitState::WaitComplete;
        drop(slot);
        self.condvar.notify_all();
        true
    }

    /// Blocks until the wait completes or an interrupt arrives. Spurious
    /// wake-ups re-check the state.
    pub(crate) fn wait(&self) -> std::result::Result<(), Interrupt> {
        let mut slot = self.slot.lock();
        loop {
            if slot.state == WaitState::WaitComplete {
                return Ok(());
            }
            if let Some(interrupt) = slot.interrupt.take() {
                return Err(interrupt);
            }
            self.condvar.wait(&mut slot);
        }
    }
}

pub(crate) struct QueuedWaiter {
    pub(crate) database_id: Oid,
    pub(crate) xid: TransactionId,
    pub(crate) waiter: Arc<BackendWaiter>,
}

impl QueuedWaiter {
    fn backend_id(&self) -> BackendId {
        self.waiter.backend_id()
    }
}

/// The active and retry queues. A backend is in at most one of them.
#[derive(Default)]
pub(crate) struct WaitQueues {
    active: VecDeque<QueuedWaiter>,
    retry: VecDeque<QueuedWaiter>,
}

impl WaitQueues {
    pub(crate) fn push_active(&mut self, waiter: QueuedWaiter) {
        self.remove(waiter.backend_id());
        self.active.push_back(waiter);
    }

    /// First waiter of `database_id` in the chosen queue.
    pub(crate) fn first_for(&self, database_id: Oid, from_active: bool) -> Option<&QueuedWaiter> {
        let queue = if from_active { &self.active } else { &self.retry };
        queue.iter().find(|w| w.database_id == database_id)
    }

    /// Moves the waiter of `backend_id` for `xid` to the tail of the retry
    /// queue. Returns false if it is in neither queue, i.e. it already
    /// detached.
    pub(crate) fn move_to_retry(&mut self, backend_id: BackendId, xid: TransactionId) -> bool {
        match self.take(|w| w.backend_id() == backend_id && w.xid == xid) {
            Some(waiter) => {
                self.retry.push_back(waiter);
                true
            }
            None => false,
        }
    }

    /// Dequeues the waiter of `backend_id` for `xid`.
    pub(crate) fn remove_for(&mut self, backend_id: BackendId, xid: TransactionId) -> bool {
        self.take(|w| w.backend_id() == backend_id && w.xid == xid)
            .is_some()
    }

    pub(crate) fn remove(&mut self, backend_id: BackendId) -> bool {
        self.take(|w| w.backend_id() == backend_id).is_some()
    }

    fn take<F>(&mut self, matches: F) -> Option<QueuedWaiter>
    where
        F: Fn(&QueuedWaiter) -> bool,
    {
        if let Some(pos) = self.active.iter().position(&matches) {
            return self.active.remove(pos);
        }
        let pos = self.retry.iter().position(&matches)?;
        self.retry.remove(pos)
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn retry_len(&self) -> usize {
        self.retry.len()
    }

    /// Number of retry-queue waiters of `database_id`.
    pub(crate) fn retry_len_for(&self, database_id: Oid) -> usize {
        self.retry
            .iter()
            .filter(|w| w.database_id == database_id)
            .count()
    }
}
