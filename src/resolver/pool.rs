use ahash::AHashMap as HashMap;
use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::coordinator::Inner;
use crate::types::Oid;

enum ResolverMessage {
    Wake,
    Shutdown,
}

struct Worker {
    sender: Sender<ResolverMessage>,
    thread: Option<JoinHandle<()>>,
}

/// Background resolver workers, at most one per database.
pub(crate) struct ResolverPool {
    workers: Mutex<HashMap<Oid, Worker>>,
    shutting_down: AtomicBool,
}

impl ResolverPool {
    pub(crate) fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn running(&self) -> usize {
        self.workers.lock().len()
    }

    /// Wakes the worker of `database_id`, launching one if a slot is free.
    pub(crate) fn wake(&self, inner: &Arc<Inner>, database_id: Oid) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(&database_id) {
            if worker.sender.send(ResolverMessage::Wake).is_ok() {
                return;
            }
            workers.remove(&database_id);
        }
        if workers.len() >= inner.config.max_foreign_xact_resolvers {
            warn!(
                "out of foreign transaction resolver slots, cannot start a resolver for database {}",
                database_id
            );
            return;
        }

        let (sender, receiver) = unbounded();
        // Queued before the thread starts, so the first loop iteration runs.
        let _ = sender.send(ResolverMessage::Wake);
        let worker_inner = Arc::clone(inner);
        let spawned = std::thread::Builder::new()
            .name(format!("fdwxact-resolver-{}", database_id))
            .spawn(move || resolver_loop(worker_inner, database_id, receiver));
        match spawned {
            Ok(thread) => {
                workers.insert(
                    database_id,
                    Worker {
                        sender,
                        thread: Some(thread),
                    },
                );
            }
            Err(e) => error!(
                "could not start foreign transaction resolver for database {}: {}",
                database_id, e
            ),
        }
    }

    /// Removes the worker of `database_id` from the pool unless a wake-up
    /// is pending for it. Returns whether the worker may exit.
    fn retire(&self, database_id: Oid, receiver: &Receiver<ResolverMessage>) -> bool {
        let mut workers = self.workers.lock();
        if !receiver.is_empty() {
            return false;
        }
        workers.remove(&database_id);
        true
    }

    /// Stops every worker and waits for it to exit.
    pub(crate) fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let workers: Vec<Worker> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for mut worker in workers {
            let _ = worker.sender.send(ResolverMessage::Shutdown);
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("foreign transaction resolver panicked");
                }
            }
        }
    }
}

fn resolver_loop(inner: Arc<Inner>, database_id: Oid, receiver: Receiver<ResolverMessage>) {
    info!("foreign transaction resolver for database {} started", database_id);
    let ticker = tick(inner.config.resolution_retry_interval);
    let mut last_work = Instant::now();

    loop {
        let stop = select! {
            recv(receiver) -> message => match message {
                Ok(ResolverMessage::Wake) => {
                    if resolve_active(&inner, database_id) > 0 {
                        last_work = Instant::now();
                    }
                    false
                }
                Ok(ResolverMessage::Shutdown) | Err(_) => true,
            },
            recv(ticker) -> _ => {
                let done = resolve_active(&inner, database_id)
                    + resolve_retry(&inner, database_id)
                    + resolve_dangling(&inner, database_id);
                if done > 0 {
                    last_work = Instant::now();
                    false
                } else {
                    idle_for_good(&inner, database_id, &receiver, last_work)
                }
            },
        };
        if stop {
            break;
        }
    }
    info!("foreign transaction resolver for database {} stopped", database_id);
}

/// A worker retires after `resolver_timeout` without work, unless backends
/// of its database still wait on the retry queue.
fn idle_for_good(
    inner: &Inner,
    database_id: Oid,
    receiver: &Receiver<ResolverMessage>,
    last_work: Instant,
) -> bool {
    if last_work.elapsed() < inner.config.resolver_timeout {
        return false;
    }
    let retry_pending = inner.control.read().queues.retry_len_for(database_id) > 0;
    !retry_pending && inner.pool.retire(database_id, receiver)
}

/// Serves the active queue until it has no waiter of this database. A failed
/// attempt has already moved its waiter to the retry queue.
fn resolve_active(inner: &Inner, database_id: Oid) -> usize {
    let mut served = 0;
    loop {
        match inner.resolve_one(database_id, true) {
            Ok(true) => served += 1,
            Ok(false) => return served,
            Err(e) => {
                error!("foreign transaction resolution failed in database {}: {}", database_id, e);
                served += 1;
            }
        }
    }
}

/// Gives each waiter currently on the retry queue one more attempt.
fn resolve_retry(inner: &Inner, database_id: Oid) -> usize {
    let pending = inner.control.read().queues.retry_len_for(database_id);
    let mut resolved = 0;
    for _ in 0..pending {
        match inner.resolve_one(database_id, false) {
            Ok(true) => resolved += 1,
            Ok(false) => break,
            Err(e) => {
                error!("foreign transaction resolution failed in database {}: {}", database_id, e);
            }
        }
    }
    resolved
}

fn resolve_dangling(inner: &Inner, database_id: Oid) -> usize {
    match inner.resolve_all_dangling(database_id) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(
                "could not resolve dangling foreign transactions in database {}: {}",
                database_id, e
            );
            0
        }
    }
}
