//! Framed, checksummed log entries and the write buffer in front of the store.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              WriteAheadLog                    │
//! │                                              │
//! │  Buffer: [ entry | entry | entry | ... ]     │
//! │                                              │
//! │  Flush when:                                 │
//! │    1. Buffer exceeds flush_threshold bytes   │
//! │    2. Entry count hits max_buffered_entries  │
//! │    3. The writer goes idle / explicit flush  │
//! │                                              │
//! │  Recovery: strict, in sequence order         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every commit of a room is one `Delta` entry whose sequence number is the
//! commit version. Compacted state is a `Snapshot` entry carrying the version
//! it covers. Recovery never skips: a bad checksum, a foreign room or a gap
//! in the sequence fails the whole load.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::room::RoomKey;

/// WAL entry type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// One committed transaction
    Delta = 1,
    /// Full room state up to `sequence`
    Snapshot = 2,
}

/// A single log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Commit version (delta) or covered version (snapshot)
    pub sequence: u64,
    pub entry_type: WalEntryType,
    /// Room this entry belongs to
    pub room: Uuid,
    /// Opaque payload produced by the engine
    pub payload: Vec<u8>,
    /// FNV-1a style checksum over all other fields
    pub checksum: u32,
}

impl WalEntry {
    /// Create a new entry with computed checksum.
    pub fn new(sequence: u64, entry_type: WalEntryType, room: RoomKey, payload: Vec<u8>) -> Self {
        let room = room.as_uuid();
        let checksum = Self::compute_checksum(sequence, entry_type, &room, &payload);
        Self {
            sequence,
            entry_type,
            room,
            payload,
            checksum,
        }
    }

    /// Verify the entry's checksum.
    pub fn verify(&self) -> bool {
        let expected =
            Self::compute_checksum(self.sequence, self.entry_type, &self.room, &self.payload);
        self.checksum == expected
    }

    fn compute_checksum(
        sequence: u64,
        entry_type: WalEntryType,
        room: &Uuid,
        payload: &[u8],
    ) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        hash ^= sequence as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= (sequence >> 32) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= entry_type as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        for byte in room.as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        // Length first, so trailing zero bytes still change the hash
        hash ^= payload.len() as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        for chunk in payload.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            hash ^= u32::from_le_bytes(word);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    /// Serialize entry to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WalError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| WalError::SerializationError(e.to_string()))
    }

    /// Deserialize entry from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WalError> {
        let (entry, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| WalError::DeserializationError(e.to_string()))?;
        Ok(entry)
    }

    /// Approximate serialized size in bytes.
    pub fn encoded_size(&self) -> usize {
        8 + 1 + 16 + 4 + self.payload.len() + 8
    }
}

/// Write buffer configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Buffered bytes before a flush is requested. Default: 64KB.
    pub flush_threshold: usize,
    /// Buffered entries before a flush is requested. Default: 64.
    pub max_buffered_entries: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 64 * 1024,
            max_buffered_entries: 64,
        }
    }
}

impl WalConfig {
    /// Tiny buffers so tests exercise the flush path.
    pub fn for_testing() -> Self {
        Self {
            flush_threshold: 1024,
            max_buffered_entries: 4,
        }
    }
}

/// Log errors.
#[derive(Debug, Clone, Error)]
pub enum WalError {
    #[error("WAL serialization error: {0}")]
    SerializationError(String),
    #[error("WAL deserialization error: {0}")]
    DeserializationError(String),
    #[error("WAL checksum mismatch at sequence {sequence}")]
    ChecksumMismatch { sequence: u64 },
    #[error("WAL entry {sequence} belongs to room {found}, expected {expected}")]
    ForeignRoom {
        sequence: u64,
        expected: Uuid,
        found: Uuid,
    },
    #[error("WAL sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
    #[error("WAL entry {sequence} is a {found:?}, expected {expected:?}")]
    UnexpectedType {
        sequence: u64,
        expected: WalEntryType,
        found: WalEntryType,
    },
    #[error("WAL is closed")]
    Closed,
}

/// In-memory write buffer for one room.
///
/// Entries are appended without I/O and handed back in sequence order by
/// [`WriteAheadLog::flush`]; the caller writes them to the store in one batch.
pub struct WriteAheadLog {
    config: WalConfig,
    room: RoomKey,
    buffer: Vec<WalEntry>,
    buffer_bytes: usize,
    open: bool,
}

impl WriteAheadLog {
    pub fn new(config: WalConfig, room: RoomKey) -> Self {
        Self {
            buffer: Vec::with_capacity(config.max_buffered_entries),
            buffer_bytes: 0,
            open: true,
            room,
            config,
        }
    }

    /// Buffer a committed transaction under its version.
    ///
    /// Returns whether the buffer asks to be flushed.
    pub fn append_delta(&mut self, version: u64, delta: Vec<u8>) -> Result<bool, WalError> {
        self.append_entry(WalEntryType::Delta, version, delta)
    }

    /// Build a snapshot entry. Snapshots bypass the buffer: they are written
    /// only after the buffered deltas they cover.
    pub fn snapshot_entry(&self, version: u64, state: Vec<u8>) -> Result<WalEntry, WalError> {
        if !self.open {
            return Err(WalError::Closed);
        }
        Ok(WalEntry::new(version, WalEntryType::Snapshot, self.room, state))
    }

    fn append_entry(
        &mut self,
        entry_type: WalEntryType,
        sequence: u64,
        payload: Vec<u8>,
    ) -> Result<bool, WalError> {
        if !self.open {
            return Err(WalError::Closed);
        }
        if let Some(last) = self.buffer.last() {
            if sequence != last.sequence + 1 {
                return Err(WalError::SequenceGap {
                    expected: last.sequence + 1,
                    found: sequence,
                });
            }
        }

        let entry = WalEntry::new(sequence, entry_type, self.room, payload);
        self.buffer_bytes += entry.encoded_size();
        self.buffer.push(entry);
        Ok(self.needs_flush())
    }

    pub fn needs_flush(&self) -> bool {
        self.buffer_bytes >= self.config.flush_threshold
            || self.buffer.len() >= self.config.max_buffered_entries
    }

    /// Take all buffered entries for persistence.
    pub fn flush(&mut self) -> Vec<WalEntry> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let entries = std::mem::take(&mut self.buffer);
        self.buffer_bytes = 0;
        self.buffer = Vec::with_capacity(self.config.max_buffered_entries);
        entries
    }

    /// Drop buffered entries without writing them (the room is being wiped).
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.buffer_bytes = 0;
        dropped
    }

    /// Close the log, returning whatever was still buffered.
    pub fn close(&mut self) -> Vec<WalEntry> {
        self.open = false;
        self.flush()
    }

    /// Decode and validate the stored delta records of one room.
    ///
    /// `records` are `(version, bytes)` pairs as read from the store, and
    /// `after` is the version already covered by the snapshot. The result is
    /// every delta in order, or the first integrity failure.
    pub fn recover_entries(
        room: RoomKey,
        after: u64,
        records: &[(u64, Vec<u8>)],
    ) -> Result<Vec<WalEntry>, WalError> {
        let mut valid = Vec::with_capacity(records.len());
        let mut expected = after + 1;

        for (version, bytes) in records {
            let entry = WalEntry::decode(bytes)?;
            check_entry(&entry, room, WalEntryType::Delta)?;
            if entry.sequence != *version || entry.sequence != expected {
                return Err(WalError::SequenceGap {
                    expected,
                    found: entry.sequence,
                });
            }
            expected += 1;
            valid.push(entry);
        }

        Ok(valid)
    }

    /// Decode and validate a stored snapshot record.
    pub fn recover_snapshot(room: RoomKey, bytes: &[u8]) -> Result<WalEntry, WalError> {
        let entry = WalEntry::decode(bytes)?;
        check_entry(&entry, room, WalEntryType::Snapshot)?;
        Ok(entry)
    }
}

fn check_entry(entry: &WalEntry, room: RoomKey, expected: WalEntryType) -> Result<(), WalError> {
    if !entry.verify() {
        return Err(WalError::ChecksumMismatch {
            sequence: entry.sequence,
        });
    }
    if entry.room != room.as_uuid() {
        return Err(WalError::ForeignRoom {
            sequence: entry.sequence,
            expected: room.as_uuid(),
            found: entry.room,
        });
    }
    if entry.entry_type != expected {
        return Err(WalError::UnexpectedType {
            sequence: entry.sequence,
            expected,
            found: entry.entry_type,
        });
    }
    Ok(())
}
