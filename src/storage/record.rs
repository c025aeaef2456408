use serde::{Deserialize, Serialize};

use crate::table::FdwXactEntry;
use crate::types::{FdwXactKey, Oid};

/// Durable description of one foreign transaction entry. Written as the
/// payload of an INSERT record and, after a checkpoint, as its own file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FdwXactOnDiskData {
    pub key: FdwXactKey,
    pub user_mapping_id: Oid,
    pub fdwxact_id: String,
}

impl From<&FdwXactEntry> for FdwXactOnDiskData {
    fn from(entry: &FdwXactEntry) -> Self {
        Self {
            key: entry.key,
            user_mapping_id: entry.user_mapping_id,
            fdwxact_id: entry.fdwxact_id.clone(),
        }
    }
}

/// WAL records of the foreign transaction table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// An entry was created.
    Insert(FdwXactOnDiskData),
    /// An entry was resolved or forgotten.
    Remove(FdwXactKey),
}
