//! Write-ahead log guarding state file rewrites.
//!
//! A snapshot is appended here before the state file is replaced and a
//! commit marker follows once the new file is in place. If the process dies
//! in between, the pending snapshot is replayed on the next load.
//!
//! File layout: `STW\0`, a version byte, then frames of
//! `[len: u32 LE][msgpack entry][crc32: u32 LE]`. Scanning stops at the first
//! frame that is short or fails its checksum; that tail is cut off on open.

use crate::error::{Result, StoreError};
use crate::types::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"STW\0";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 5;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Whether an entry still needs replaying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntryStatus {
    Pending,
    Committed,
}

/// One logged entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub status: WalEntryStatus,
    pub operation: WalOperation,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WalOperation {
    /// The full document about to become the state file.
    SaveSnapshot {
        /// Version token of the tree, when it carries one.
        version: Option<String>,
        document: Vec<u8>,
    },
    /// Confirms the snapshot with the same `seq`.
    Commit,
}

struct Tail {
    file: File,
    next_seq: u64,
}

/// Append-only log of snapshot writes.
pub struct WriteAheadLog {
    path: PathBuf,
    tail: Mutex<Tail>,
}

impl WriteAheadLog {
    /// Open the log at `path`, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let next_seq = if !path.exists() {
            reset(&path)?;
            1
        } else if header_is_truncated(&path)? {
            tracing::warn!(path = %path.display(), "write-ahead log header is truncated, reinitialising");
            reset(&path)?;
            1
        } else {
            let scan = scan(&path)?;
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() > scan.valid_len {
                tracing::warn!(path = %path.display(), "truncating torn write-ahead log tail");
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
            scan.entries.iter().map(|e| e.seq).max().unwrap_or(0) + 1
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            tail: Mutex::new(Tail { file, next_seq }),
        })
    }

    /// Append a pending entry and return its sequence number.
    pub fn log(&self, operation: WalOperation) -> Result<u64> {
        let mut tail = self.tail.lock();
        let seq = tail.next_seq;
        write_frame(
            &mut tail.file,
            &WalEntry {
                seq,
                status: WalEntryStatus::Pending,
                operation,
                timestamp: Timestamp::now(),
            },
        )?;
        tail.next_seq += 1;
        Ok(seq)
    }

    /// Append the commit marker for `seq`.
    pub fn commit(&self, seq: u64) -> Result<()> {
        let mut tail = self.tail.lock();
        write_frame(
            &mut tail.file,
            &WalEntry {
                seq,
                status: WalEntryStatus::Committed,
                operation: WalOperation::Commit,
                timestamp: Timestamp::now(),
            },
        )
    }

    /// Entries without a commit marker, oldest first.
    pub fn pending_entries(&self) -> Result<Vec<WalEntry>> {
        let _tail = self.tail.lock();
        let entries = scan(&self.path)?.entries;

        let committed: HashSet<u64> = entries
            .iter()
            .filter(|e| e.status == WalEntryStatus::Committed)
            .map(|e| e.seq)
            .collect();

        let mut pending: Vec<WalEntry> = entries
            .into_iter()
            .filter(|e| e.status == WalEntryStatus::Pending && !committed.contains(&e.seq))
            .collect();
        pending.sort_by_key(|e| e.seq);
        Ok(pending)
    }

    /// The newest uncommitted entry.
    pub fn latest_pending(&self) -> Result<Option<WalEntry>> {
        Ok(self.pending_entries()?.pop())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending_entries()?.is_empty())
    }

    /// Drop every entry. Sequence numbers restart at 1.
    pub fn clear(&self) -> Result<()> {
        let mut tail = self.tail.lock();
        reset(&self.path)?;
        tail.file = OpenOptions::new().append(true).open(&self.path)?;
        tail.next_seq = 1;
        Ok(())
    }
}

struct Scan {
    entries: Vec<WalEntry>,
    /// Bytes up to the end of the last intact frame.
    valid_len: u64,
}

fn scan(path: &Path) -> Result<Scan> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut header = [0u8; HEADER_LEN as usize];
    reader
        .read_exact(&mut header)
        .map_err(|_| StoreError::InvalidFormat("write-ahead log header is truncated".into()))?;
    if &header[..MAGIC.len()] != MAGIC {
        return Err(StoreError::InvalidFormat("not a write-ahead log".into()));
    }
    if header[MAGIC.len()] != FORMAT_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "unsupported write-ahead log version {}",
            header[MAGIC.len()]
        )));
    }

    let mut entries = Vec::new();
    let mut valid_len = HEADER_LEN;
    loop {
        match read_frame(&mut reader) {
            Ok((entry, frame_len)) => {
                entries.push(entry);
                valid_len += frame_len;
            }
            Err(e) => {
                if !is_clean_eof(&e) {
                    tracing::debug!(error = %e, offset = valid_len, "write-ahead log scan stopped");
                }
                break;
            }
        }
    }

    Ok(Scan { entries, valid_len })
}

fn is_clean_eof(error: &StoreError) -> bool {
    matches!(error, StoreError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

fn header() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..MAGIC.len()].copy_from_slice(MAGIC);
    header[MAGIC.len()] = FORMAT_VERSION;
    header
}

/// True when the file holds nothing but a prefix of our header, as left by
/// a crash while the log was being reset.
fn header_is_truncated(path: &Path) -> Result<bool> {
    if fs::metadata(path)?.len() >= HEADER_LEN {
        return Ok(false);
    }
    let bytes = fs::read(path)?;
    Ok(header().starts_with(&bytes))
}

/// Replace the log with a bare header. The new file is written beside the
/// old one and renamed into place, so the log is never observed half-reset.
fn reset(path: &Path) -> Result<()> {
    let mut tmp_name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("wal"));
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&header())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Encode and durably append one frame in a single write.
fn write_frame(file: &mut File, entry: &WalEntry) -> Result<()> {
    let payload = rmp_serde::to_vec(entry)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_FRAME_BYTES)
        .ok_or_else(|| StoreError::Serialization("write-ahead log entry too large".into()))?;

    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

    file.write_all(&frame)?;
    file.sync_data()?;
    Ok(())
}

/// Read one frame, returning the entry and the bytes consumed.
fn read_frame(reader: &mut impl Read) -> Result<(WalEntry, u64)> {
    let mut word = [0u8; 4];
    reader.read_exact(&mut word)?;
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(StoreError::Corruption(format!("frame length {} out of range", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    reader.read_exact(&mut word)?;
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Err(StoreError::Corruption("frame checksum mismatch".into()));
    }

    let entry = rmp_serde::from_slice(&payload)?;
    Ok((entry, len as u64 + 8))
}
