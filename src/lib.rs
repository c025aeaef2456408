pub mod admin;
pub mod commit_policy;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod errors;
pub mod local_xact;
pub mod participant;
pub mod recovery;
pub mod resolver;
pub mod session;
pub mod storage;
pub mod table;
pub mod types;

// Re-export key types and structs for easier access
pub use admin::FdwXactStatusRow;
pub use config::{CommitPolicy, FailureSeverity, FdwXactConfig};
pub use coordinator::FdwXactManager;
pub use driver::{DriverCapabilities, DriverError, DriverRegistry, FdwXactState, ForeignDriver};
pub use errors::{FdwXactError, Result};
pub use local_xact::{LocalXactOracle, LocalXactStatus, XactStatusMap};
pub use participant::{FdwXactParticipant, ParticipantList};
pub use resolver::queue::{BackendWaiter, WaitState};
pub use session::{FdwXactSession, WaitOutcome};
pub use storage::{FdwXactOnDiskData, FileWal, WalRecord, XactLog};
pub use table::{FdwXactEntry, FdwXactStatus};
pub use types::{BackendId, FDWXACT_ID_MAX_LEN, FdwXactKey, Lsn, LsnRange, Oid, TransactionId};

/// Foreign transaction coordinator prelude
pub mod prelude {
    pub use crate::config::*;
    pub use crate::driver::*;
    pub use crate::errors::*;
    pub use crate::local_xact::*;
    pub use crate::storage::*;
    pub use crate::types::*;
    pub use crate::*;
}
