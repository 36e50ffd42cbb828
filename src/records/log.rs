//! Append-only record log.

use crate::error::{Result, StoreError};
use crate::types::{LogEntry, RecordId, StoredValue, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::warn;

/// Magic bytes for each log entry.
const LOG_MAGIC: &[u8; 4] = b"REC\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header fields: magic + version + flags + id + timestamp + kind + body length.
const HEADER_FIELDS_SIZE: usize = 4 + 1 + 1 + 8 + 8 + 1 + 4;

/// Header fields followed by their CRC-32.
const ENTRY_HEADER_SIZE: u64 = HEADER_FIELDS_SIZE as u64 + 4;

/// Trailing CRC-32 of the body.
const ENTRY_CHECKSUM_SIZE: u64 = 4;

/// Append-only record log.
///
/// Each entry is a checksummed header followed by a MessagePack-encoded
/// [`StoredValue`] and a CRC-32 of the body. An entry that runs past the end
/// of the file (crash mid-append) is cut off when the log is opened; any
/// other damage fails the open and leaves the file untouched.
pub struct RecordLog {
    file: RwLock<File>,

    /// Next record ID to assign.
    next_id: Mutex<u64>,

    /// Current file size (append position).
    file_size: RwLock<u64>,

    writes_since_sync: Mutex<u64>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl RecordLog {
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a record log with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a record log.
    /// - sync_interval = 0 or 1: sync every write
    /// - larger values trade durability of the last few writes for speed
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let (max_id, valid_len) = Self::scan(&file, file_size)?;

        if valid_len < file_size {
            warn!(
                path = %path.display(),
                valid_len,
                file_size,
                "discarding torn entry at end of record log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            file: RwLock::new(file),
            next_id: Mutex::new(max_id + 1),
            file_size: RwLock::new(valid_len),
            writes_since_sync: Mutex::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append a value, returning the new entry and the offset it was written at.
    pub fn append(&self, value: StoredValue) -> Result<(LogEntry, u64)> {
        let body = rmp_serde::to_vec(&value)?;
        let mut file = self.file.write();

        let mut next_id = self.next_id.lock();
        let entry = LogEntry {
            id: RecordId(*next_id),
            timestamp: Timestamp::now(),
            value,
        };

        let offset = *self.file_size.read();
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = Vec::with_capacity((ENTRY_HEADER_SIZE + ENTRY_CHECKSUM_SIZE) as usize + body.len());
        buf.extend_from_slice(LOG_MAGIC);
        buf.push(LOG_VERSION);
        buf.push(0); // flags (reserved)
        buf.extend_from_slice(&entry.id.0.to_le_bytes());
        buf.extend_from_slice(&entry.timestamp.0.to_le_bytes());
        buf.push(entry.value.kind());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        let header_checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&header_checksum.to_le_bytes());
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        file.write_all(&buf)?;

        *next_id += 1;
        *self.file_size.write() = offset + buf.len() as u64;

        let mut writes = self.writes_since_sync.lock();
        *writes += 1;
        if *writes >= self.sync_interval {
            file.sync_all()?;
            *writes = 0;
        }

        Ok((entry, offset))
    }

    /// Read the entry at a given offset.
    pub fn read_at(&self, offset: u64) -> Result<LogEntry> {
        let mut file = self.file.write();
        let remaining = self.size().checked_sub(offset).ok_or_else(|| {
            StoreError::InvalidFormat(format!("Offset {} is past the end of the log", offset))
        })?;
        file.seek(SeekFrom::Start(offset))?;
        match read_entry(&mut BufReader::new(&mut *file), remaining)? {
            Some((entry, _)) => Ok(entry),
            None => Err(truncated(offset)),
        }
    }

    /// All entries in append order, paired with their offsets.
    pub fn entries(&self) -> Result<Vec<(u64, LogEntry)>> {
        let mut file = self.file.write();
        let end = *self.file_size.read();
        file.seek(SeekFrom::Start(0))?;

        let mut reader = BufReader::new(&mut *file);
        let mut entries = Vec::new();
        let mut offset = 0u64;
        while offset < end {
            let (entry, len) =
                read_entry(&mut reader, end - offset)?.ok_or_else(|| truncated(offset))?;
            entries.push((offset, entry));
            offset += len;
        }
        Ok(entries)
    }

    /// Drop every entry and restart id assignment.
    pub fn truncate(&self) -> Result<()> {
        let file = self.file.write();
        file.set_len(0)?;
        file.sync_all()?;

        *self.file_size.write() = 0;
        *self.next_id.lock() = 1;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.write().sync_all()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        *self.file_size.read()
    }

    /// Walk the file, returning the highest id and the length of the valid
    /// prefix. Stops at an entry that runs past the end of the file; any
    /// checksum or format failure is reported instead.
    fn scan(file: &File, file_size: u64) -> Result<(u64, u64)> {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut max_id = 0u64;
        let mut offset = 0u64;
        while offset < file_size {
            match read_entry(&mut reader, file_size - offset)? {
                Some((entry, len)) => {
                    max_id = max_id.max(entry.id.0);
                    offset += len;
                }
                None => break,
            }
        }

        Ok((max_id, offset))
    }
}

/// Decode one entry from the reader's current position, returning it with
/// its encoded length. `remaining` is the number of bytes left in the file;
/// `None` means the entry is cut short by the end of the file.
fn read_entry<R: Read>(reader: &mut R, remaining: u64) -> Result<Option<(LogEntry, u64)>> {
    if remaining < ENTRY_HEADER_SIZE {
        return Ok(None);
    }

    let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
    reader.read_exact(&mut header)?;

    let (fields, checksum) = header.split_at(HEADER_FIELDS_SIZE);
    let expected = u32::from_le_bytes(le_array(checksum));
    let got = crc32fast::hash(fields);
    if expected != got {
        return Err(StoreError::InvalidFormat(format!(
            "Record header checksum mismatch: expected {}, got {}",
            expected, got
        )));
    }

    if &header[0..4] != LOG_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid record magic".into()));
    }
    if header[4] != LOG_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported log version: {}",
            header[4]
        )));
    }

    let id = RecordId(u64::from_le_bytes(le_array(&header[6..14])));
    let timestamp = Timestamp(i64::from_le_bytes(le_array(&header[14..22])));
    let kind = header[22];
    let body_len = u32::from_le_bytes(le_array(&header[23..27])) as u64;

    let len = ENTRY_HEADER_SIZE + body_len + ENTRY_CHECKSUM_SIZE;
    if len > remaining {
        return Ok(None);
    }

    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body)?;

    let mut checksum = [0u8; 4];
    reader.read_exact(&mut checksum)?;
    let expected = u32::from_le_bytes(checksum);
    let got = crc32fast::hash(&body);
    if expected != got {
        return Err(StoreError::ChecksumMismatch { expected, got });
    }

    let value: StoredValue = rmp_serde::from_slice(&body)?;
    if value.kind() != kind {
        return Err(StoreError::InvalidFormat(format!(
            "Entry {} has kind {} but body decodes as kind {}",
            id,
            kind,
            value.kind()
        )));
    }

    Ok(Some((LogEntry { id, timestamp, value }, len)))
}

fn truncated(offset: u64) -> StoreError {
    StoreError::InvalidFormat(format!("Record entry at offset {} is truncated", offset))
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(bytes);
    arr
}
