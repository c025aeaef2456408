//! Durable state of the foreign transaction table: WAL records, the log
//! itself and the per-entry state files written at checkpoint.

pub mod record;
pub mod state_file;
pub mod wal;

pub use record::{FdwXactOnDiskData, WalRecord};
pub use wal::{FileWal, XactLog};
