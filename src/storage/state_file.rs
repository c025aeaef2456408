use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::errors::{FdwXactError, Result};
use crate::storage::record::FdwXactOnDiskData;
use crate::types::FdwXactKey;

/// Directory holding one file per filed entry, relative to the data directory.
pub const FDWXACT_DIR: &str = "pg_fdw_xact";

const FILE_NAME_LEN: usize = 8 * 4 + 3;
const CRC_LEN: usize = 4;

pub fn state_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(FDWXACT_DIR)
}

pub fn file_name(key: &FdwXactKey) -> String {
    format!(
        "{:08X}_{:08X}_{:08X}_{:08X}",
        key.database_id, key.xid, key.server_id, key.user_id
    )
}

/// Parses a state file name back into its key. Anything that is not exactly
/// four underscore-separated 8-digit hex fields is rejected.
pub fn parse_file_name(name: &str) -> Option<FdwXactKey> {
    if name.len() != FILE_NAME_LEN {
        return None;
    }
    let mut fields = [0u32; 4];
    let mut parts = name.split('_');
    for field in fields.iter_mut() {
        let part = parts.next()?;
        if part.len() != 8 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *field = u32::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(FdwXactKey {
        database_id: fields[0],
        xid: fields[1],
        server_id: fields[2],
        user_id: fields[3],
    })
}

/// Writes the payload followed by its CRC32C and fsyncs the file. The
/// directory itself is synced separately, once per checkpoint.
pub fn write_state_file(dir: &Path, data: &FdwXactOnDiskData) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut content = bincode::serialize(data)?;
    let crc = crc32c::crc32c(&content);
    content.extend_from_slice(&crc.to_le_bytes());

    let path = dir.join(file_name(&data.key));
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(&content)?;
    file.sync_all()?;
    debug!("Wrote state file {}", path.display());
    Ok(())
}

/// Reads the file of `key`, checking its CRC and that it describes `key`.
pub fn read_state_file(dir: &Path, key: &FdwXactKey) -> Result<FdwXactOnDiskData> {
    let path = dir.join(file_name(key));
    let content = fs::read(&path)?;
    if content.len() < CRC_LEN {
        return Err(FdwXactError::Corrupted(format!(
            "state file {} is too short",
            path.display()
        )));
    }
    let (payload, trailer) = content.split_at(content.len() - CRC_LEN);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32c::crc32c(payload) != stored {
        return Err(FdwXactError::Corrupted(format!(
            "calculated CRC checksum does not match value stored in {}",
            path.display()
        )));
    }
    let data: FdwXactOnDiskData = bincode::deserialize(payload)?;
    if data.key != *key {
        return Err(FdwXactError::Corrupted(format!(
            "state file {} describes {} instead",
            path.display(),
            data.key
        )));
    }
    Ok(data)
}

/// Deletes the file of `key`. A missing file is only worth a warning when
/// the caller expected one to exist.
pub fn remove_state_file(dir: &Path, key: &FdwXactKey, give_warnings: bool) -> Result<()> {
    let path = dir.join(file_name(key));
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!("Removed state file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if give_warnings {
                warn!("could not remove file {}: {}", path.display(), e);
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Keys of every well-named file in `dir`, sorted. Other files are ignored.
pub fn list_state_files(dir: &Path) -> Result<Vec<FdwXactKey>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(key) = entry.file_name().to_str().and_then(parse_file_name) {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(keys)
}

/// Makes file creations and removals in `dir` durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(not(target_os = "windows"))]
    {
        if dir.exists() {
            File::open(dir)?.sync_data()?;
        }
    }
    #[cfg(target_os = "windows")]
    {
        let _ = dir;
    }
    Ok(())
}
