//! Write-ahead log access for the foreign transaction table.
//!
//! The coordinator only needs to append records, force them to disk and read
//! a record back by position, so the log is reached through [`XactLog`].
//! [`FileWal`] is a single-file implementation: each record is framed as
//! `len (u32 LE) | crc32c (u32 LE) | bincode payload`, and its LSN is the
//! byte offset of the frame.

use log::{debug, warn};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{FdwXactError, Result};
use crate::storage::record::{FdwXactOnDiskData, WalRecord};
use crate::types::{Lsn, LsnRange};

const WAL_MAGIC: &[u8; 8] = b"FDWXLOG1";
const FRAME_HEADER_LEN: u64 = 8;
/// Upper bound on a record payload. A header claiming more is garbage.
const MAX_PAYLOAD_LEN: usize = 64 * 1024;

pub trait XactLog: Send + Sync {
    /// Appends `record` and returns its position. The record is not durable
    /// until a [`flush`](XactLog::flush) covering `end` returns.
    fn append(&self, record: &WalRecord) -> Result<LsnRange>;

    /// Makes every record ending at or before `upto` durable.
    fn flush(&self, upto: Lsn) -> Result<()>;

    /// Reads back the record starting at `start`.
    fn read_record(&self, start: Lsn) -> Result<WalRecord>;

    /// Reads back the payload of the INSERT record starting at `start`.
    fn read_insert(&self, start: Lsn) -> Result<FdwXactOnDiskData> {
        match self.read_record(start)? {
            WalRecord::Insert(data) => Ok(data),
            WalRecord::Remove(key) => Err(FdwXactError::Corrupted(format!(
                "expected an INSERT record at {}, found REMOVE of {}",
                start, key
            ))),
        }
    }
}

struct WalWriter {
    file: File,
    insert_lsn: u64,
    flushed_lsn: u64,
}

pub struct FileWal {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    reader: Mutex<File>,
}

impl FileWal {
    /// Opens the log at `path`, creating it if needed. A torn record at the
    /// tail, left by a crash in the middle of an append, is cut off.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let end = if len == 0 {
            file.write_all(WAL_MAGIC)?;
            file.sync_all()?;
            WAL_MAGIC.len() as u64
        } else {
            let mut magic = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)
                .map_err(|_| FdwXactError::Corrupted(format!("{} is not a WAL file", path.display())))?;
            if &magic != WAL_MAGIC {
                return Err(FdwXactError::Corrupted(format!(
                    "{} is not a WAL file",
                    path.display()
                )));
            }
            let end = scan_valid_end(&path)?;
            if end < len {
                warn!(
                    "Truncating torn WAL tail of {} bytes in {}",
                    len - end,
                    path.display()
                );
                file.set_len(end)?;
                file.sync_all()?;
            }
            end
        };
        file.seek(SeekFrom::Start(end))?;

        let reader = File::open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(WalWriter {
                file,
                insert_lsn: end,
                flushed_lsn: end,
            }),
            reader: Mutex::new(reader),
        })
    }

    /// Position where the next record will be written.
    pub fn insert_lsn(&self) -> Lsn {
        Lsn(self.writer.lock().insert_lsn)
    }

    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.writer.lock().flushed_lsn)
    }

    /// Returns every intact record starting at or after `from`, in log order.
    pub fn replay(&self, from: Lsn) -> Result<Vec<(LsnRange, WalRecord)>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut pos = from.0.max(WAL_MAGIC.len() as u64);
        reader.seek(SeekFrom::Start(pos))?;

        let mut records = Vec::new();
        while let Some(payload) = read_frame(&mut reader)? {
            let end = pos + FRAME_HEADER_LEN + payload.len() as u64;
            let record: WalRecord = bincode::deserialize(&payload)?;
            records.push((
                LsnRange {
                    start: Lsn(pos),
                    end: Lsn(end),
                },
                record,
            ));
            pos = end;
        }
        debug!("Replayed {} WAL records from {}", records.len(), from);
        Ok(records)
    }
}

impl XactLog for FileWal {
    fn append(&self, record: &WalRecord) -> Result<LsnRange> {
        let payload = bincode::serialize(record)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut writer = self.writer.lock();
        let start = writer.insert_lsn;
        write_frame(&mut writer.file, start, &frame)?;
        writer.insert_lsn += frame.len() as u64;
        Ok(LsnRange {
            start: Lsn(start),
            end: Lsn(writer.insert_lsn),
        })
    }

    fn flush(&self, upto: Lsn) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.flushed_lsn >= upto.0 {
            return Ok(());
        }
        writer.file.sync_data()?;
        writer.flushed_lsn = writer.insert_lsn;
        Ok(())
    }

    fn read_record(&self, start: Lsn) -> Result<WalRecord> {
        let mut reader = self.reader.lock();
        reader.seek(SeekFrom::Start(start.0))?;
        match read_frame(&mut *reader)? {
            Some(payload) => Ok(bincode::deserialize(&payload)?),
            None => Err(FdwXactError::Corrupted(format!(
                "could not read WAL record at {}",
                start
            ))),
        }
    }
}

/// File handle the log writes frames to.
trait LogFile: Write + Seek {
    fn set_len(&mut self, len: u64) -> std::io::Result<()>;
}

impl LogFile for File {
    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        File::set_len(self, len)
    }
}

/// Writes `frame` at `at`. A failed write is cut back to `at` so that the
/// next frame still starts at its LSN.
fn write_frame<F: LogFile>(file: &mut F, at: u64, frame: &[u8]) -> Result<()> {
    if let Err(e) = file.write_all(frame) {
        warn!("WAL write at {} failed, discarding partial frame: {}", at, e);
        file.set_len(at)?;
        file.seek(SeekFrom::Start(at))?;
        return Err(e.into());
    }
    Ok(())
}

/// Reads one frame. Returns `None` at end of file or when the frame is
/// incomplete or fails its checksum.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_PAYLOAD_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if crc32c::crc32c(&payload) != expected_crc {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn scan_valid_end(path: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut pos = WAL_MAGIC.len() as u64;
    reader.seek(SeekFrom::Start(pos))?;
    while let Some(payload) = read_frame(&mut reader)? {
        pos += FRAME_HEADER_LEN + payload.len() as u64;
    }
    Ok(pos)
}
