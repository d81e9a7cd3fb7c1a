//! RocksDB-backed room store.
//!
//! Column families:
//! - `snapshots` — compacted room state as a framed [`WalEntry`] (LZ4 compressed)
//! - `deltas`    — one framed entry per commit, keyed by `room:version` (LZ4 compressed)
//! - `metadata`  — room metadata (bincode)
//!
//! Each room lives in its own database directory below the store root, but
//! every key is still prefixed with the room key so a database can hold
//! several rooms.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

use crate::delta::{CompressedDelta, DeltaError};
use crate::room::RoomKey;
use crate::wal::{WalEntry, WalEntryType, WalError, WriteAheadLog};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_DELTAS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory; each room gets a subdirectory
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessel_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches rooted at `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }

    /// Same settings, rooted at the room's own directory.
    pub fn for_room(&self, room: RoomKey) -> Self {
        Self {
            path: self.path.join(room.dir_name()),
            ..self.clone()
        }
    }
}

/// Metadata stored next to each room's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room: Uuid,
    /// Latest persisted commit version
    pub version: u64,
    /// Version covered by the stored snapshot (0 = none)
    pub base_version: u64,
    /// Deltas stored on top of the snapshot
    pub delta_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room: RoomKey) -> Self {
        let now = now_secs();
        Self {
            room: room.as_uuid(),
            version: 0,
            base_version: 0,
            delta_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("room not found: {0}")]
    NotFound(Uuid),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error(transparent)]
    Compression(#[from] DeltaError),
    #[error("corrupted log: {0}")]
    Corrupt(#[from] WalError),
    #[error("I/O error: {0}")]
    Io(String),
}

impl StoreError {
    /// Whether the stored bytes themselves are bad, as opposed to the medium.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Deserialization(_) | StoreError::Compression(_) | StoreError::Corrupt(_)
        )
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Everything persisted for one room, validated and in commit order.
#[derive(Debug, Clone, Default)]
pub struct StoredRoom {
    pub snapshot: Option<WalEntry>,
    pub deltas: Vec<WalEntry>,
    pub metadata: Option<RoomMetadata>,
}

impl StoredRoom {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.deltas.is_empty()
    }

    /// Version of the last stored commit.
    pub fn head_version(&self) -> u64 {
        self.deltas
            .last()
            .map(|d| d.sequence)
            .or_else(|| self.snapshot.as_ref().map(|s| s.sequence))
            .unwrap_or(0)
    }

    pub fn base_version(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.sequence).unwrap_or(0)
    }
}

/// RocksDB-backed store for room logs.
pub struct RoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RoomStore {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("opened room store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Payloads are already LZ4 blocks
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DELTAS => {
                // Many small writes, scanned by room prefix
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    // ─── Loading ──────────────────────────────────────────────────────

    /// Load and validate the snapshot plus every delta stored after it.
    ///
    /// Any decode, checksum or ordering problem fails the whole load.
    pub fn load_room(&self, room: RoomKey) -> Result<StoredRoom, StoreError> {
        let snapshot = match self.load_snapshot_bytes(room)? {
            Some(bytes) => Some(WriteAheadLog::recover_snapshot(room, &bytes)?),
            None => None,
        };
        let base = snapshot.as_ref().map(|s| s.sequence).unwrap_or(0);

        let records = self.load_deltas_since(room, base + 1)?;
        let deltas = WriteAheadLog::recover_entries(room, base, &records)?;

        let metadata = match self.load_metadata(room) {
            Ok(meta) => Some(meta),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        Ok(StoredRoom {
            snapshot,
            deltas,
            metadata,
        })
    }

    fn load_snapshot_bytes(&self, room: RoomKey) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(compressed) => {
                let stored = CompressedDelta::from_stored(0, compressed.to_vec());
                Ok(Some(stored.decompress()?))
            }
            None => Ok(None),
        }
    }

    /// Raw (decompressed, still framed) delta records from `since` onward.
    fn load_deltas_since(
        &self,
        room: RoomKey,
        since: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = Self::delta_key(room, since);

        let mut deltas = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            let Some(version) = Self::delta_version(room, &key) else {
                break;
            };
            let stored = CompressedDelta::from_stored(version, value.to_vec());
            deltas.push((version, stored.decompress()?));
        }

        Ok(deltas)
    }

    pub fn load_metadata(&self, room: RoomKey) -> Result<RoomMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(room.as_uuid())),
        }
    }

    // ─── Writing ──────────────────────────────────────────────────────

    /// Persist a run of delta entries in one atomic batch.
    ///
    /// Entries must be consecutive and continue the stored log. Returns the
    /// number of compressed bytes written.
    pub fn write_deltas(&self, room: RoomKey, entries: &[WalEntry]) -> Result<u64, StoreError> {
        let Some(last) = entries.last() else {
            return Ok(0);
        };
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.metadata_or_new(room)?;
        let mut expected = meta.version + 1;
        let mut batch = WriteBatch::default();
        let mut written = 0u64;

        for entry in entries {
            if entry.entry_type != WalEntryType::Delta {
                return Err(WalError::UnexpectedType {
                    sequence: entry.sequence,
                    expected: WalEntryType::Delta,
                    found: entry.entry_type,
                }
                .into());
            }
            if entry.sequence != expected {
                return Err(WalError::SequenceGap {
                    expected,
                    found: entry.sequence,
                }
                .into());
            }
            expected += 1;

            let compressed = CompressedDelta::compress(entry.sequence, &entry.encode()?);
            written += compressed.compressed_size() as u64;
            batch.put_cf(&cf_deltas, Self::delta_key(room, entry.sequence), &compressed.compressed);
        }

        meta.version = last.sequence;
        meta.delta_count += entries.len() as u64;
        meta.updated_at = now_secs();
        batch.put_cf(&cf_meta, room.as_bytes(), meta.encode()?);

        self.write(batch)?;
        Ok(written)
    }

    /// Store a snapshot entry and drop the deltas it covers, atomically.
    pub fn save_snapshot(&self, room: RoomKey, entry: &WalEntry) -> Result<RoomMetadata, StoreError> {
        if entry.entry_type != WalEntryType::Snapshot {
            return Err(WalError::UnexpectedType {
                sequence: entry.sequence,
                expected: WalEntryType::Snapshot,
                found: entry.entry_type,
            }
            .into());
        }
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = CompressedDelta::compress(entry.sequence, &entry.encode()?);

        let mut meta = self.metadata_or_new(room)?;
        if entry.sequence > meta.version {
            return Err(DeltaError::VersionMismatch {
                expected: meta.version,
                got: entry.sequence,
            }
            .into());
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, room.as_bytes(), &compressed.compressed);
        let removed = self.delete_deltas_into(&mut batch, room, entry.sequence)?;

        meta.base_version = entry.sequence;
        meta.delta_count = meta.delta_count.saturating_sub(removed);
        meta.snapshot_size = entry.payload.len() as u64;
        meta.compressed_size = compressed.compressed_size() as u64;
        meta.updated_at = now_secs();
        batch.put_cf(&cf_meta, room.as_bytes(), meta.encode()?);

        self.write(batch)?;
        Ok(meta)
    }

    /// Remove every record of the room.
    pub fn delete_room(&self, room: RoomKey) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snap, room.as_bytes());
        batch.delete_cf(&cf_meta, room.as_bytes());
        self.delete_deltas_into(&mut batch, room, u64::MAX)?;

        self.write(batch)?;
        log::debug!("deleted all records of room {room}");
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn metadata_or_new(&self, room: RoomKey) -> Result<RoomMetadata, StoreError> {
        match self.load_metadata(room) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(RoomMetadata::new(room)),
            Err(e) => Err(e),
        }
    }

    fn delete_deltas_into(
        &self,
        batch: &mut WriteBatch,
        room: RoomKey,
        up_to_version: u64,
    ) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = Self::delta_key(room, 0);

        let mut count = 0u64;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            match Self::delta_version(room, &key) {
                Some(version) if version <= up_to_version => {
                    batch.delete_cf(&cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }
        Ok(count)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    /// Delta key: room (16 bytes) + version (8 bytes big-endian).
    fn delta_key(room: RoomKey, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(room.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    /// Version encoded in a delta key, if the key belongs to `room`.
    fn delta_version(room: RoomKey, key: &[u8]) -> Option<u64> {
        if key.len() != 24 || &key[..16] != room.as_bytes() {
            return None;
        }
        let mut ver_buf = [0u8; 8];
        ver_buf.copy_from_slice(&key[16..24]);
        Some(u64::from_be_bytes(ver_buf))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
