//! File-backed message log.
//!
//! Every mutation is appended to `messages.log` as a checksummed frame and
//! applied to an in-memory [`MemoryLog`] window. Opening the log replays the
//! frames to rebuild the window.

use super::memory::MemoryLog;
use super::MessageStore;
use crate::error::{ChatError, Result};
use crate::types::{Message, Sequence, Timestamp};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the message log.
const LOG_MAGIC: &[u8; 4] = b"CHT\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LOG_FILE: &str = "messages.log";
const COMPACT_FILE: &str = "messages.log.compact";
const LOCK_FILE: &str = "LOCK";

/// Outcome of reading one frame during replay.
enum Frame {
    /// A complete, verified entry and its size on disk.
    Entry(LogEntry, u64),
    /// The frame runs past the end of the file.
    Torn,
    /// A complete frame that failed verification.
    Damaged { len: u64, error: ChatError },
}

/// One frame in the log file.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum LogEntry {
    /// A message was appended.
    Append(Message),
    /// The message with this sequence was deleted.
    Delete(Sequence),
    /// Counters carried over by compaction.
    Checkpoint {
        next_sequence: Sequence,
        window_start: Sequence,
    },
}

/// Durable message log.
pub struct DurableLog {
    /// Directory holding the log and lock file.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Log file handle.
    file: File,

    /// Current file size (for appending and rollback).
    file_size: u64,

    /// Retained window.
    window: MemoryLog,

    /// Number of writes since last sync.
    writes_since_sync: u64,

    /// Sync every N writes.
    sync_interval: u64,

    /// Set when a write or sync failure left the file in an unknown state.
    poisoned: bool,

    #[cfg(test)]
    fail_next_sync: bool,
}

impl DurableLog {
    /// Default sync interval, matching the config default.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a log directory with the default sync interval.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        Self::open_with_sync_interval(path, capacity, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log directory.
    /// - sync_interval = 0 or 1: sync every write (safest, slowest)
    /// - sync_interval = 100: sync every 100 writes
    pub fn open_with_sync_interval(
        path: impl AsRef<Path>,
        capacity: usize,
        sync_interval: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = Self::acquire_lock(&path)?;

        let log_path = path.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        let mut window = MemoryLog::new(capacity);
        let file_size = if file.metadata()?.len() == 0 {
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            HEADER_SIZE
        } else {
            Self::replay(&mut file, &mut window)?
        };

        tracing::debug!(
            path = %log_path.display(),
            retained = window.len(),
            latest = window.latest().0,
            "opened durable message log"
        );

        Ok(Self {
            path,
            _lock_file: lock_file,
            file,
            file_size,
            window,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
            poisoned: false,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Directory holding the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log file in bytes.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Replay all frames into `window`. Returns the offset after the last
    /// valid frame.
    ///
    /// Only the final frame may be cut off: one that runs past the end of the
    /// file, or the last frame failing its checksum, is truncated. A damaged
    /// frame with data after it fails the open.
    fn replay(file: &mut File, window: &mut MemoryLog) -> Result<u64> {
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut *file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(ChatError::InvalidFormat("Invalid message log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(ChatError::InvalidFormat(format!(
                "Unsupported message log version: {}",
                version[0]
            )));
        }

        let mut offset = HEADER_SIZE;
        while offset < file_len {
            match Self::read_frame(&mut reader, file_len - offset)? {
                Frame::Entry(entry, frame_len) => {
                    Self::apply(window, entry);
                    offset += frame_len;
                }
                Frame::Torn => {
                    tracing::warn!(offset, file_len, "truncating torn tail of message log");
                    break;
                }
                Frame::Damaged { len, error } if offset + len == file_len => {
                    tracing::warn!(
                        offset,
                        file_len,
                        error = %error,
                        "truncating damaged final frame of message log"
                    );
                    break;
                }
                Frame::Damaged { error, .. } => {
                    tracing::error!(offset, file_len, error = %error, "message log is corrupt");
                    return Err(error);
                }
            }
        }
        drop(reader);

        if offset < file_len {
            file.set_len(offset)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(offset))?;

        Ok(offset)
    }

    fn apply(window: &mut MemoryLog, entry: LogEntry) {
        match entry {
            LogEntry::Append(message) => window.push_existing(message),
            LogEntry::Delete(sequence) => {
                // MemoryLog::remove is infallible.
                let _ = window.remove(sequence);
            }
            LogEntry::Checkpoint {
                next_sequence,
                window_start,
            } => window.restore_counters(next_sequence, window_start),
        }
    }

    fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;
        if encoded.len() > MAX_FRAME_SIZE {
            return Err(ChatError::Validation(format!(
                "entry is {} bytes encoded, limit is {}",
                encoded.len(),
                MAX_FRAME_SIZE
            )));
        }

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    /// Read one frame with `remaining` bytes left in the file.
    fn read_frame<R: Read>(reader: &mut R, remaining: u64) -> Result<Frame> {
        if remaining < 8 {
            return Ok(Frame::Torn);
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let frame_len = len as u64 + 8;

        if frame_len > remaining {
            return Ok(Frame::Torn);
        }
        if len > MAX_FRAME_SIZE {
            return Ok(Frame::Damaged {
                len: frame_len,
                error: ChatError::Corruption("Message log frame too large".into()),
            });
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);

        if stored_checksum != computed_checksum {
            return Ok(Frame::Damaged {
                len: frame_len,
                error: ChatError::ChecksumMismatch {
                    expected: stored_checksum,
                    got: computed_checksum,
                },
            });
        }

        match rmp_serde::from_slice(&encoded) {
            Ok(entry) => Ok(Frame::Entry(entry, frame_len)),
            Err(e) => Ok(Frame::Damaged {
                len: frame_len,
                error: e.into(),
            }),
        }
    }

    /// Append a frame at the end of the file. On a write failure the file is
    /// cut back to its previous length; if even that fails the log is
    /// poisoned. A failed sync also cuts the frame back and poisons the log,
    /// since earlier unsynced frames may be lost.
    fn write_entry(&mut self, entry: &LogEntry) -> Result<()> {
        self.ensure_healthy()?;

        let frame = Self::encode_frame(entry)?;
        let offset = self.file_size;

        let written = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&frame));

        if let Err(e) = written {
            tracing::warn!(offset, error = %e, "message log write failed, rolling back");
            if self.file.set_len(offset).is_err() {
                self.poisoned = true;
            }
            return Err(e.into());
        }

        if self.writes_since_sync + 1 >= self.sync_interval {
            if let Err(e) = self.sync_file() {
                tracing::error!(offset, error = %e, "message log sync failed, poisoning log");
                let _ = self.file.set_len(offset);
                self.poisoned = true;
                return Err(e.into());
            }
            self.writes_since_sync = 0;
        } else {
            self.writes_since_sync += 1;
        }

        self.file_size = offset + frame.len() as u64;
        Ok(())
    }

    fn sync_file(&mut self) -> std::io::Result<()> {
        if self.take_injected_sync_failure() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected sync failure",
            ));
        }
        self.file.sync_data()
    }

    #[cfg(test)]
    fn take_injected_sync_failure(&mut self) -> bool {
        std::mem::take(&mut self.fail_next_sync)
    }

    #[cfg(not(test))]
    fn take_injected_sync_failure(&mut self) -> bool {
        false
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.poisoned {
            return Err(ChatError::BackendUnavailable(
                "message log is poisoned by an earlier write failure".into(),
            ));
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| ChatError::Locked)?;

        Ok(lock_file)
    }
}

impl MessageStore for DurableLog {
    fn append(&mut self, sender: String, content: String, timestamp: Timestamp) -> Result<Message> {
        let message = Message {
            sequence: self.window.next_sequence(),
            sender,
            content,
            timestamp,
        };

        self.write_entry(&LogEntry::Append(message.clone()))?;
        self.window.push_existing(message.clone());

        Ok(message)
    }

    fn range(&self, after: Sequence, limit: usize) -> Vec<Message> {
        self.window.range(after, limit)
    }

    fn tail(&self, limit: usize) -> Vec<Message> {
        self.window.tail(limit)
    }

    fn remove(&mut self, sequence: Sequence) -> Result<Option<Message>> {
        if !self.window.contains(sequence) {
            return Ok(None);
        }

        self.write_entry(&LogEntry::Delete(sequence))?;
        self.window.remove(sequence)
    }

    fn len(&self) -> usize {
        self.window.len()
    }

    fn capacity(&self) -> usize {
        self.window.capacity()
    }

    fn latest(&self) -> Sequence {
        self.window.latest()
    }

    fn oldest_retained(&self) -> Sequence {
        self.window.oldest_retained()
    }

    fn sync(&mut self) -> Result<()> {
        self.ensure_healthy()?;
        self.file.sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Rewrite the file with only the retained window.
    ///
    /// The new file is written beside the old one, synced, then renamed over
    /// it, so a crash leaves either the old or the new log intact.
    fn compact(&mut self) -> Result<()> {
        self.ensure_healthy()?;

        let before = self.file_size;
        let compact_path = self.path.join(COMPACT_FILE);
        let log_path = self.path.join(LOG_FILE);

        let mut size = HEADER_SIZE;
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&compact_path)?;
            let mut writer = BufWriter::new(file);

            writer.write_all(LOG_MAGIC)?;
            writer.write_all(&[LOG_VERSION])?;

            let checkpoint = LogEntry::Checkpoint {
                next_sequence: self.window.next_sequence(),
                window_start: self.window.oldest_retained(),
            };
            let frame = Self::encode_frame(&checkpoint)?;
            writer.write_all(&frame)?;
            size += frame.len() as u64;

            for message in self.window.tail(self.window.len()) {
                let frame = Self::encode_frame(&LogEntry::Append(message))?;
                writer.write_all(&frame)?;
                size += frame.len() as u64;
            }

            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }

        fs::rename(&compact_path, &log_path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&log_path)?;
        file.seek(SeekFrom::Start(size))?;
        self.file = file;
        self.file_size = size;
        self.writes_since_sync = 0;

        tracing::info!(before, after = size, "compacted message log");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "durable"
    }
}

impl Drop for DurableLog {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = MessageStore::sync(self);
    }
}
