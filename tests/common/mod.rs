//! Common utilities for fdwxact integration tests.

#![allow(dead_code)]

use ahash::AHashSet as HashSet;
use fdwxact::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const DB: Oid = 1;
pub const USER: Oid = 10;
pub const WRAPPER: &str = "mock_fdw";

/// Something observable that happened during a test, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WalFlush,
    Prepare { server_id: Oid, fdwxact_id: String },
    Commit { server_id: Oid },
    Rollback { server_id: Oid },
    Resolve { server_id: Oid, fdwxact_id: String, is_commit: bool },
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

// --- MockDriver ---

/// A foreign data wrapper that records every call and fails on demand.
pub struct MockDriver {
    name: String,
    events: EventLog,
    capabilities: DriverCapabilities,
    prepare_id: Option<String>,
    not_two_phase: Mutex<HashSet<Oid>>,
    fail_prepare: Mutex<HashSet<Oid>>,
    fail_commit: Mutex<HashSet<Oid>>,
    fail_rollback: Mutex<HashSet<Oid>>,
    fail_resolve: Mutex<HashSet<Oid>>,
}

impl MockDriver {
    pub fn new(name: &str, events: EventLog) -> Self {
        Self::with_capabilities(name, events, DriverCapabilities::default())
    }

    pub fn with_capabilities(name: &str, events: EventLog, capabilities: DriverCapabilities) -> Self {
        Self {
            name: name.to_string(),
            events,
            capabilities,
            prepare_id: None,
            not_two_phase: Mutex::new(HashSet::new()),
            fail_prepare: Mutex::new(HashSet::new()),
            fail_commit: Mutex::new(HashSet::new()),
            fail_rollback: Mutex::new(HashSet::new()),
            fail_resolve: Mutex::new(HashSet::new()),
        }
    }

    /// A driver that names its own prepared transactions.
    pub fn with_prepare_id(name: &str, events: EventLog, prepare_id: String) -> Self {
        let mut driver = Self::with_capabilities(
            name,
            events,
            DriverCapabilities {
                get_prepare_id: true,
                ..DriverCapabilities::default()
            },
        );
        driver.prepare_id = Some(prepare_id);
        driver
    }

    pub fn set_two_phase_capable(&self, server_id: Oid, capable: bool) {
        toggle(&self.not_two_phase, server_id, !capable);
    }

    pub fn fail_prepare(&self, server_id: Oid, fail: bool) {
        toggle(&self.fail_prepare, server_id, fail);
    }

    pub fn fail_commit(&self, server_id: Oid, fail: bool) {
        toggle(&self.fail_commit, server_id, fail);
    }

    pub fn fail_rollback(&self, server_id: Oid, fail: bool) {
        toggle(&self.fail_rollback, server_id, fail);
    }

    pub fn fail_resolve(&self, server_id: Oid, fail: bool) {
        toggle(&self.fail_resolve, server_id, fail);
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

fn toggle(set: &Mutex<HashSet<Oid>>, server_id: Oid, on: bool) {
    let mut set = set.lock().unwrap();
    if on {
        set.insert(server_id);
    } else {
        set.remove(&server_id);
    }
}

fn fails(set: &Mutex<HashSet<Oid>>, server_id: Oid) -> bool {
    set.lock().unwrap().contains(&server_id)
}

impl ForeignDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn is_two_phase_capable(&self, server_id: Oid) -> bool {
        !fails(&self.not_two_phase, server_id)
    }

    fn get_prepare_id(&self, _xid: TransactionId, _server_id: Oid, _user_id: Oid) -> Option<String> {
        self.prepare_id.clone()
    }

    fn prepare(&self, state: &FdwXactState) -> std::result::Result<bool, DriverError> {
        if fails(&self.fail_prepare, state.server_id) {
            return Err(DriverError::Remote("prepare refused".to_string()));
        }
        self.record(Event::Prepare {
            server_id: state.server_id,
            fdwxact_id: state.fdwxact_id.clone().unwrap_or_default(),
        });
        Ok(true)
    }

    fn commit(&self, state: &FdwXactState) -> std::result::Result<(), DriverError> {
        if fails(&self.fail_commit, state.server_id) {
            return Err(DriverError::Connection("server closed the connection".to_string()));
        }
        self.record(Event::Commit {
            server_id: state.server_id,
        });
        Ok(())
    }

    fn rollback(&self, state: &FdwXactState) -> std::result::Result<(), DriverError> {
        self.record(Event::Rollback {
            server_id: state.server_id,
        });
        if fails(&self.fail_rollback, state.server_id) {
            return Err(DriverError::Connection("server closed the connection".to_string()));
        }
        Ok(())
    }

    fn resolve(&self, state: &FdwXactState, is_commit: bool) -> std::result::Result<(), DriverError> {
        if fails(&self.fail_resolve, state.server_id) {
            return Err(DriverError::Connection("could not connect to server".to_string()));
        }
        self.record(Event::Resolve {
            server_id: state.server_id,
            fdwxact_id: state.fdwxact_id.clone().unwrap_or_default(),
            is_commit,
        });
        Ok(())
    }
}

// --- RecordingWal ---

/// A [`FileWal`] that also records every flush in the event log.
pub struct RecordingWal {
    wal: Arc<FileWal>,
    events: EventLog,
}

impl XactLog for RecordingWal {
    fn append(&self, record: &WalRecord) -> Result<LsnRange> {
        self.wal.append(record)
    }

    fn flush(&self, upto: Lsn) -> Result<()> {
        self.events.lock().unwrap().push(Event::WalFlush);
        self.wal.flush(upto)
    }

    fn read_record(&self, start: Lsn) -> Result<WalRecord> {
        self.wal.read_record(start)
    }
}

// --- Helper Functions ---

pub struct TestEnv {
    pub manager: FdwXactManager,
    pub driver: Arc<MockDriver>,
    pub drivers: Arc<DriverRegistry>,
    pub oracle: Arc<XactStatusMap>,
    pub wal: Arc<FileWal>,
    pub events: EventLog,
    pub dir: TempDir,
}

impl TestEnv {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn state_dir(&self) -> PathBuf {
        storage::state_file::state_dir(self.dir.path())
    }

    /// A second manager over the same data directory and WAL file, as after
    /// a restart. Shares drivers, events and the status oracle.
    pub fn restart(&self) -> (FdwXactManager, Arc<FileWal>) {
        let wal = Arc::new(FileWal::open(wal_path(self.dir.path())).unwrap());
        let recording = Arc::new(RecordingWal {
            wal: Arc::clone(&wal),
            events: Arc::clone(&self.events),
        });
        let manager = FdwXactManager::new(
            self.manager.config().clone(),
            recording,
            self.oracle.clone(),
            Arc::clone(&self.drivers),
        )
        .unwrap();
        (manager, wal)
    }
}

/// Configuration used by most tests: resolvers are driven by the test.
pub fn test_config(data_dir: &Path, policy: CommitPolicy) -> FdwXactConfig {
    FdwXactConfig {
        commit_policy: policy,
        data_dir: data_dir.to_path_buf(),
        autostart_resolvers: false,
        resolution_retry_interval: Duration::from_millis(20),
        resolver_timeout: Duration::from_millis(500),
        ..FdwXactConfig::default()
    }
}

pub fn wal_path(data_dir: &Path) -> PathBuf {
    data_dir.join("pg_wal").join("fdwxact.log")
}

pub fn setup(policy: CommitPolicy) -> TestEnv {
    setup_with(|config| config.commit_policy = policy)
}

/// Sets up servers 1 to 3 on one mock driver, with `tweak` applied to the
/// default test configuration.
pub fn setup_with<F>(tweak: F) -> TestEnv
where
    F: FnOnce(&mut FdwXactConfig),
{
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), CommitPolicy::Disabled);
    tweak(&mut config);

    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let driver = Arc::new(MockDriver::new(WRAPPER, Arc::clone(&events)));
    let drivers = Arc::new(DriverRegistry::new());
    drivers.register_driver(driver.clone());
    for server_id in 1..=3 {
        drivers.add_server(server_id, WRAPPER);
        drivers.add_user_mapping(server_id, USER, 100 + server_id);
    }

    let wal = Arc::new(FileWal::open(wal_path(dir.path())).unwrap());
    let recording = Arc::new(RecordingWal {
        wal: Arc::clone(&wal),
        events: Arc::clone(&events),
    });
    let oracle = Arc::new(XactStatusMap::new());
    let manager =
        FdwXactManager::new(config, recording, oracle.clone(), Arc::clone(&drivers)).unwrap();

    TestEnv {
        manager,
        driver,
        drivers,
        oracle,
        wal,
        events,
        dir,
    }
}

/// Starts `xid` on a new session and registers the given servers as modified.
pub fn session_with_writes(env: &TestEnv, xid: TransactionId, servers: &[Oid]) -> FdwXactSession {
    let mut session = env.manager.session(DB);
    session.begin(xid);
    for &server_id in servers {
        session.register_participant(server_id, USER, true).unwrap();
    }
    session
}

/// Leaves prepared entries of `xid` on `servers` behind without an owner,
/// as an aborted transaction would.
pub fn orphan_prepared(env: &TestEnv, xid: TransactionId, servers: &[Oid]) {
    let mut session = session_with_writes(env, xid, servers);
    session.set_commit_policy(CommitPolicy::Prefer).unwrap();
    session.note_local_write();
    session.pre_commit().unwrap();
    session.finish(false);
}

/// Polls `condition` until it holds, for at most five seconds.
pub fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}
