use thiserror::Error;

use crate::types::{BackendId, FdwXactKey, Oid, TransactionId};

#[derive(Error, Debug)]
pub enum FdwXactError {
    /// The foreign data wrapper does not expose a callback that atomic commit needs.
    #[error("foreign data wrapper \"{driver}\" does not provide the {callback} callback")]
    MissingCallback {
        callback: &'static str,
        driver: String,
    },

    /// A capacity knob is zero, so foreign transactions cannot be prepared.
    #[error("prepared foreign transactions are disabled, set {knob} to a nonzero value")]
    CapacityDisabled { knob: &'static str },

    /// The commit policy cannot be enabled while a capacity knob is zero.
    #[error("cannot set commit policy to \"{policy}\" while {knob} is zero")]
    InvalidCommitPolicy {
        policy: &'static str,
        knob: &'static str,
    },

    #[error("foreign server {0} is not registered")]
    UnknownServer(Oid),

    /// Strict policy: a modified server cannot take part in two-phase commit.
    #[error("cannot commit a distributed transaction that modified a server not capable of two-phase commit")]
    CannotCommitDistributed,

    #[error("could not prepare transaction on server {server_id} for user {user_id}: {reason}")]
    RemotePrepareFailed {
        server_id: Oid,
        user_id: Oid,
        reason: String,
    },

    #[error("could not commit transaction on server {server_id} for user {user_id}: {reason}")]
    RemoteCommitFailed {
        server_id: Oid,
        user_id: Oid,
        reason: String,
    },

    #[error("could not resolve foreign transaction on server {server_id} for user {user_id}: {reason}")]
    RemoteResolveFailed {
        server_id: Oid,
        user_id: Oid,
        reason: String,
    },

    #[error("foreign transaction identifier is too long ({len} bytes, maximum {max})")]
    IdentifierTooLong { len: usize, max: usize },

    #[error("foreign transaction {0} already exists")]
    DuplicateEntry(FdwXactKey),

    #[error("maximum number of prepared foreign transactions reached ({max})")]
    TableFull { max: usize },

    /// Only transactions that finished locally can have their foreign parts resolved.
    #[error("cannot resolve foreign transactions of local transaction {0} that is still in progress")]
    TransactionInProgress(TransactionId),

    #[error("foreign transaction {0} does not exist")]
    EntryNotFound(FdwXactKey),

    #[error("foreign transaction {key} is in use by backend {backend}")]
    EntryBusy { key: FdwXactKey, backend: BackendId },

    #[error("must be superuser to {0}")]
    PermissionDenied(&'static str),

    #[error("corrupted foreign transaction state: {0}")]
    Corrupted(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for FdwXactError {
    fn from(err: bincode::Error) -> Self {
        FdwXactError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FdwXactError>;
