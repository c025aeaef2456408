use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::errors::{FdwXactError, Result};
use crate::types::{Oid, TransactionId};

/// Error type for calls into a foreign data wrapper.
///
/// A driver reports a remote refusal or a transport failure here. The
/// coordinator decides how severe the failure is from the point in the
/// protocol where it happened.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The foreign server answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The foreign server could not be reached.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("driver error: {0}")]
    Other(String),
}

/// The set of transaction callbacks a foreign data wrapper provides.
///
/// A driver with `transaction_management == false` handles its own
/// transactions outside of the coordinator; writes through it can never be
/// prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub transaction_management: bool,
    pub prepare: bool,
    pub commit: bool,
    pub rollback: bool,
    pub resolve: bool,
    pub get_prepare_id: bool,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self {
            transaction_management: true,
            prepare: true,
            commit: true,
            rollback: true,
            resolve: true,
            get_prepare_id: false,
        }
    }
}

/// Parameters handed to a single driver callback. Built fresh for every call.
#[derive(Clone)]
pub struct FdwXactState {
    pub server_id: Oid,
    pub user_id: Oid,
    pub user_mapping_id: Oid,
    /// Identifier the transaction was (or is being) prepared under. `None`
    /// for one-phase commit and rollback of transactions never prepared.
    pub fdwxact_id: Option<String>,
    /// Driver-private state attached while the transaction was running.
    pub fdw_state: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for FdwXactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdwXactState")
            .field("server_id", &self.server_id)
            .field("user_id", &self.user_id)
            .field("user_mapping_id", &self.user_mapping_id)
            .field("fdwxact_id", &self.fdwxact_id)
            .field("fdw_state", &self.fdw_state.is_some())
            .finish()
    }
}

/// Transaction callbacks of a foreign data wrapper.
///
/// Every call is synchronous and may block on the network. Implementations
/// must be `Send` and `Sync`; one driver instance serves all servers of its
/// wrapper type from any number of backends and resolvers.
pub trait ForeignDriver: Send + Sync {
    /// Name of the foreign data wrapper, used in error messages.
    fn name(&self) -> &str;

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    /// Whether transactions on `server_id` can be prepared.
    fn is_two_phase_capable(&self, server_id: Oid) -> bool;

    /// Identifier to prepare the transaction under. Returning `None` lets the
    /// coordinator synthesize one.
    fn get_prepare_id(&self, _xid: TransactionId, _server_id: Oid, _user_id: Oid) -> Option<String> {
        None
    }

    /// Phase 1. Returns `Ok(true)` once the remote transaction is durably
    /// prepared, `Ok(false)` if the server refused to prepare it.
    fn prepare(&self, state: &FdwXactState) -> std::result::Result<bool, DriverError>;

    /// One-phase commit of a transaction that was never prepared.
    fn commit(&self, state: &FdwXactState) -> std::result::Result<(), DriverError>;

    /// Rollback of a transaction that was not (or not known to be) prepared.
    fn rollback(&self, state: &FdwXactState) -> std::result::Result<(), DriverError>;

    /// Phase 2. Commits or rolls back the prepared transaction `state.fdwxact_id`.
    fn resolve(&self, state: &FdwXactState, is_commit: bool) -> std::result::Result<(), DriverError>;
}

/// A foreign server resolved to the driver that serves it.
#[derive(Clone)]
pub struct ForeignServer {
    pub server_id: Oid,
    pub driver: Arc<dyn ForeignDriver>,
}

#[derive(Default)]
struct Catalog {
    drivers: HashMap<String, Arc<dyn ForeignDriver>>,
    servers: HashMap<Oid, String>,
    user_mappings: HashMap<(Oid, Oid), Oid>,
}

/// Maps foreign servers to their wrapper's driver and users to user mappings.
#[derive(Default)]
pub struct DriverRegistry {
    catalog: RwLock<Catalog>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver under its wrapper name, replacing any previous one.
    pub fn register_driver(&self, driver: Arc<dyn ForeignDriver>) {
        let name = driver.name().to_string();
        self.catalog.write().drivers.insert(name, driver);
    }

    /// Declares `server_id` as a server of the wrapper `wrapper`.
    pub fn add_server(&self, server_id: Oid, wrapper: &str) {
        self.catalog
            .write()
            .servers
            .insert(server_id, wrapper.to_string());
    }

    pub fn add_user_mapping(&self, server_id: Oid, user_id: Oid, user_mapping_id: Oid) {
        self.catalog
            .write()
            .user_mappings
            .insert((server_id, user_id), user_mapping_id);
    }

    pub fn lookup(&self, server_id: Oid) -> Result<ForeignServer> {
        let catalog = self.catalog.read();
        let driver = catalog
            .servers
            .get(&server_id)
            .and_then(|wrapper| catalog.drivers.get(wrapper))
            .ok_or(FdwXactError::UnknownServer(server_id))?;
        Ok(ForeignServer {
            server_id,
            driver: Arc::clone(driver),
        })
    }

    /// User mapping of `user_id` on `server_id`, falling back to the public
    /// mapping (user 0). Returns 0 when neither exists.
    pub fn user_mapping_id(&self, server_id: Oid, user_id: Oid) -> Oid {
        let catalog = self.catalog.read();
        catalog
            .user_mappings
            .get(&(server_id, user_id))
            .or_else(|| catalog.user_mappings.get(&(server_id, 0)))
            .copied()
            .unwrap_or(0)
    }
}
