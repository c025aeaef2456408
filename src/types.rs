use serde::{Deserialize, Serialize};
use std::fmt;

/// Object identifier of a database, foreign server, user or user mapping.
pub type Oid = u32;

/// Local transaction identifier.
pub type TransactionId = u32;

/// Identifier of a backend (one session) that owns foreign transactions.
pub type BackendId = u32;

/// Maximum length in bytes of a foreign transaction identifier.
pub const FDWXACT_ID_MAX_LEN: usize = 200;

/// A position in the write-ahead log.
///
/// `Lsn::INVALID` (zero) marks "no WAL position", e.g. an entry whose payload
/// lives in its own file rather than in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.0 >> 32, self.0 as u32)
    }
}

/// WAL positions bracketing one record: `start` is where it begins, `end`
/// is the first byte after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LsnRange {
    pub start: Lsn,
    pub end: Lsn,
}

/// Unique key of a foreign transaction entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FdwXactKey {
    pub database_id: Oid,
    pub xid: TransactionId,
    pub server_id: Oid,
    pub user_id: Oid,
}

impl fmt::Display for FdwXactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(db {}, xid {}, server {}, user {})",
            self.database_id, self.xid, self.server_id, self.user_id
        )
    }
}
