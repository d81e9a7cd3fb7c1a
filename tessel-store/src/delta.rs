//! Delta compression and compaction bookkeeping for room logs.
//!
//! Every committed transaction becomes one delta record. Records are LZ4
//! compressed before they hit RocksDB, and once enough of them pile up on
//! top of the last snapshot the owner writes a fresh snapshot and drops the
//! deltas it covers.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              DeltaLog                     │
//! │                                          │
//! │  Snapshot@v ◄── v+1 ◄── v+2 ◄── … ◄── h  │
//! │  (compressed)   (LZ4)   (LZ4)            │
//! │                                          │
//! │  Compaction: snapshot@h, drop v+1..=h    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! `DeltaLog` only tracks versions and sizes; the payloads live in the
//! store, so a long-lived room does not keep its history in memory.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A compressed delta record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedDelta {
    /// Commit version this record belongs to
    pub version: u64,
    /// Original uncompressed size in bytes
    pub original_size: u32,
    /// LZ4-compressed payload (size-prepended block)
    pub compressed: Vec<u8>,
}

impl CompressedDelta {
    /// Compress raw record bytes.
    pub fn compress(version: u64, data: &[u8]) -> Self {
        Self {
            version,
            original_size: data.len() as u32,
            compressed: lz4_compress(data),
        }
    }

    /// Wrap bytes already read back from storage.
    pub fn from_stored(version: u64, compressed: Vec<u8>) -> Self {
        let original_size = compressed
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        Self {
            version,
            original_size,
            compressed,
        }
    }

    /// Decompress the payload.
    pub fn decompress(&self) -> Result<Vec<u8>, DeltaError> {
        lz4_decompress(&self.compressed).map_err(|e| match e {
            DeltaError::DecompressionFailed { reason, .. } => DeltaError::DecompressionFailed {
                version: self.version,
                reason,
            },
            other => other,
        })
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }
}

/// Delta errors.
#[derive(Debug, Clone, Error)]
pub enum DeltaError {
    #[error("decompression failed for version {version}: {reason}")]
    DecompressionFailed { version: u64, reason: String },
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u64, got: u64 },
}

/// Statistics for a room's delta log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaStats {
    /// Deltas stored on top of the base snapshot
    pub delta_count: u64,
    /// Total uncompressed bytes of those deltas
    pub total_original_bytes: u64,
    /// Version covered by the base snapshot (0 = none)
    pub base_version: u64,
    /// Latest committed version
    pub head_version: u64,
}

/// Version and size bookkeeping for one room's commit log.
///
/// The owner calls [`DeltaLog::append`] for each commit and compacts when it
/// returns `true`, then reports the compaction with
/// [`DeltaLog::mark_compacted`].
#[derive(Debug, Clone)]
pub struct DeltaLog {
    base_version: u64,
    head_version: u64,
    pending: u64,
    original_bytes: u64,
    compaction_threshold: usize,
}

impl DeltaLog {
    pub fn new(compaction_threshold: usize) -> Self {
        Self {
            base_version: 0,
            head_version: 0,
            pending: 0,
            original_bytes: 0,
            compaction_threshold: compaction_threshold.max(1),
        }
    }

    /// Resume bookkeeping after a load.
    pub fn restore(compaction_threshold: usize, base_version: u64, head_version: u64) -> Self {
        let mut log = Self::new(compaction_threshold);
        log.base_version = base_version;
        log.head_version = head_version.max(base_version);
        log.pending = log.head_version - log.base_version;
        log
    }

    /// Assign the next version to a commit of `original_len` bytes.
    ///
    /// Returns the version and whether compaction is due.
    pub fn append(&mut self, original_len: usize) -> (u64, bool) {
        self.head_version += 1;
        self.pending += 1;
        self.original_bytes += original_len as u64;
        (self.head_version, self.needs_compaction())
    }

    pub fn needs_compaction(&self) -> bool {
        self.pending >= self.compaction_threshold as u64
    }

    /// Record that a snapshot now covers everything up to `version`.
    pub fn mark_compacted(&mut self, version: u64) -> Result<DeltaStats, DeltaError> {
        if version > self.head_version {
            return Err(DeltaError::VersionMismatch {
                expected: self.head_version,
                got: version,
            });
        }
        let before = self.stats();
        self.pending = self.head_version - version;
        self.base_version = version;
        self.original_bytes = 0;
        Ok(before)
    }

    /// Forget everything (the room was wiped).
    pub fn reset(&mut self) {
        *self = Self::new(self.compaction_threshold);
    }

    pub fn version(&self) -> u64 {
        self.head_version
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn stats(&self) -> DeltaStats {
        DeltaStats {
            delta_count: self.pending,
            total_original_bytes: self.original_bytes,
            base_version: self.base_version,
            head_version: self.head_version,
        }
    }
}

/// Compress raw bytes with LZ4 (size-prepended block).
pub fn lz4_compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompress LZ4 bytes produced by [`lz4_compress`].
pub fn lz4_decompress(compressed: &[u8]) -> Result<Vec<u8>, DeltaError> {
    lz4_flex::decompress_size_prepended(compressed).map_err(|e| DeltaError::DecompressionFailed {
        version: 0,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_delta_roundtrip() {
        let data = b"insert notes[0] {\"id\":\"n1\",\"title\":\"New Note\"}";
        let delta = CompressedDelta::compress(1, data);

        assert_eq!(delta.version, 1);
        assert_eq!(delta.original_size, data.len() as u32);
        assert_eq!(delta.decompress().unwrap(), data);
    }

    #[test]
    fn test_from_stored_reads_prepended_size() {
        let data = vec![7u8; 300];
        let stored = lz4_compress(&data);
        let delta = CompressedDelta::from_stored(9, stored);
        assert_eq!(delta.original_size, 300);
        assert!(delta.compressed_size() < 300);
    }

    #[test]
    fn test_corrupt_delta_reports_version() {
        let delta = CompressedDelta::from_stored(42, vec![16, 0, 0, 0, 0xFF, 0xFF]);
        match delta.decompress() {
            Err(DeltaError::DecompressionFailed { version, .. }) => assert_eq!(version, 42),
            other => panic!("expected decompression failure, got {other:?}"),
        }
    }

    #[test]
    fn test_delta_log_threshold() {
        let mut log = DeltaLog::new(3);
        assert_eq!(log.append(10), (1, false));
        assert_eq!(log.append(10), (2, false));
        assert_eq!(log.append(10), (3, true));
        assert!(log.needs_compaction());

        let stats = log.mark_compacted(3).unwrap();
        assert_eq!(stats.delta_count, 3);
        assert_eq!(stats.total_original_bytes, 30);
        assert_eq!(log.stats().delta_count, 0);
        assert_eq!(log.stats().total_original_bytes, 0);
        assert_eq!(log.base_version(), 3);
        assert_eq!(log.append(1), (4, false));
    }

    #[test]
    fn test_delta_log_rejects_future_compaction() {
        let mut log = DeltaLog::new(10);
        log.append(1);
        assert!(log.mark_compacted(5).is_err());
    }

    #[test]
    fn test_delta_log_restore() {
        let log = DeltaLog::restore(100, 40, 57);
        assert_eq!(log.version(), 57);
        assert_eq!(log.base_version(), 40);
        assert_eq!(log.stats().delta_count, 17);
    }

    #[test]
    fn test_delta_log_reset() {
        let mut log = DeltaLog::new(5);
        log.append(4);
        log.append(4);
        log.reset();
        assert_eq!(log.version(), 0);
        assert_eq!(log.stats(), DeltaStats::default());
    }

    #[test]
    fn test_structured_data_compresses() {
        let mut data = Vec::with_capacity(10_000);
        for i in 0..1000u16 {
            data.extend_from_slice(&[0u8; 6]);
            data.extend_from_slice(&i.to_le_bytes());
            data.extend_from_slice(b"op");
        }
        let delta = CompressedDelta::compress(1, &data);
        assert!(delta.compressed_size() * 2 < delta.original_size as usize);
    }
}
