//! Durable store adapter.
//!
//! Each persisted room owns one writer thread. The thread opens the room's
//! RocksDB directory, answers the initial load, and then applies commands in
//! the order they were enqueued, so storage order equals commit order.
//!
//! ```text
//!  Document ──Append/Snapshot/Wipe──► unbounded channel ──► writer thread
//!                                                             │  WriteAheadLog buffer
//!                                                             ▼
//!                                                          RoomStore (RocksDB)
//!  events ◄── Unavailable / WriteFailed / DecodeFailed / Wiped / Compacted
//! ```
//!
//! Writes never fail the caller. A storage problem turns the writer volatile
//! and is reported as a [`StoreEvent`]. A log that cannot be decoded halts
//! writing for the room until it is wiped, so the corrupted history is never
//! extended.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use tessel_store::{RoomKey, RoomStore, StoreConfig, StoreError, StoredRoom, WalConfig, WriteAheadLog};
use tokio::sync::mpsc;

use crate::error::DecodeError;

/// Out-of-band durability events.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The medium could not be opened or read; the session is volatile.
    Unavailable { reason: String },
    /// A write failed; later writes are dropped.
    WriteFailed { reason: String },
    /// The persisted log could not be replayed.
    DecodeFailed(DecodeError),
    /// All persisted state of the room was removed.
    Wiped,
    /// A snapshot now covers every commit up to `version`.
    Compacted { version: u64 },
}

/// How the initial sync ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Nothing was persisted yet.
    Fresh,
    /// Prior state was replayed; `commits` is the version it covers.
    Restored { commits: u64 },
    /// The log was unreadable; the document starts empty.
    RecoveredEmpty { error: DecodeError },
    /// No durable medium; changes live in memory only.
    Volatile { reason: String },
}

impl SyncOutcome {
    pub fn is_durable(&self) -> bool {
        matches!(self, SyncOutcome::Fresh | SyncOutcome::Restored { .. })
    }

    pub fn decode_error(&self) -> Option<&DecodeError> {
        match self {
            SyncOutcome::RecoveredEmpty { error } => Some(error),
            _ => None,
        }
    }
}

/// One committed transaction as written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub version: u64,
    pub tx: u64,
    pub update: Vec<u8>,
    pub state_vector: Vec<u8>,
}

/// Full document state at `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub version: u64,
    pub update: Vec<u8>,
    pub state_vector: Vec<u8>,
}

/// Decoded log of one room, ready for replay.
#[derive(Debug, Clone, Default)]
pub struct LoadedLog {
    pub snapshot: Option<SnapshotRecord>,
    pub commits: Vec<CommitRecord>,
}

impl LoadedLog {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.commits.is_empty()
    }

    pub fn base_version(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.version).unwrap_or(0)
    }

    pub fn head_version(&self) -> u64 {
        self.commits
            .last()
            .map(|c| c.version)
            .unwrap_or_else(|| self.base_version())
    }
}

/// What the writer found when loading.
#[derive(Debug)]
pub enum LoadResult {
    Loaded(LoadedLog),
    Corrupt(DecodeError),
    Unavailable(String),
}

/// Receives the load result on the writer thread. An `Err` means the log
/// decoded but could not be replayed.
pub type LoadCallback = Box<dyn FnOnce(LoadResult) -> Result<(), DecodeError> + Send>;

enum Command {
    Load(LoadCallback),
    Append(CommitRecord),
    Snapshot(SnapshotRecord),
    Wipe,
    Flush(std::sync::mpsc::Sender<()>),
    Close,
}

/// Handle to a room's writer thread.
pub struct DurableStore {
    room: String,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl DurableStore {
    /// Spawn the writer for `room` below `config.path`.
    ///
    /// Opening the database happens on the writer thread; a failure there is
    /// reported when the load is requested.
    pub fn open(
        room: &str,
        config: StoreConfig,
        wal: WalConfig,
        events: mpsc::UnboundedSender<StoreEvent>,
    ) -> Result<Self, StoreError> {
        let (commands, rx) = mpsc::unbounded_channel();
        let key = RoomKey::from_name(room);
        let name = room.to_string();

        let handle = std::thread::Builder::new()
            .name(format!("tessel-writer-{room}"))
            .spawn(move || Writer::start(name, key, config, wal, events).run(rx))?;
        let worker_id = handle.thread().id();

        Ok(Self {
            room: room.to_string(),
            commands,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Request the initial load. `callback` runs on the writer thread.
    pub fn load(&self, callback: LoadCallback) {
        self.send(Command::Load(callback));
    }

    /// Queue a commit for writing.
    pub fn append(&self, record: CommitRecord) {
        self.send(Command::Append(record));
    }

    /// Queue a snapshot; the deltas it covers are dropped once it is stored.
    pub fn snapshot(&self, record: SnapshotRecord) {
        self.send(Command::Snapshot(record));
    }

    /// Queue removal of everything persisted for the room.
    pub fn wipe(&self) {
        self.send(Command::Wipe);
    }

    /// Block until every queued command has reached storage.
    pub fn flush(&self) {
        if self.on_worker() || self.is_closed() {
            return;
        }
        let (ack, done) = std::sync::mpsc::channel();
        self.send(Command::Flush(ack));
        let _ = done.recv();
    }

    /// Flush and stop the writer. Safe to call more than once.
    pub fn close(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        self.send(Command::Close);
        if self.on_worker() {
            // Closed from a load callback; the thread exits on its own
            return;
        }
        if handle.join().is_err() {
            log::error!("writer thread for room `{}` panicked", self.room);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn on_worker(&self) -> bool {
        std::thread::current().id() == self.worker_id
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("writer for room `{}` is gone, command dropped", self.room);
        }
    }
}

impl Drop for DurableStore {
    fn drop(&mut self) {
        self.close();
    }
}

enum Medium {
    Durable(RoomStore),
    /// Log could not be replayed; nothing is written until a wipe.
    Halted(RoomStore),
    Volatile,
}

struct Writer {
    room: String,
    key: RoomKey,
    medium: Medium,
    unavailable: Option<String>,
    wal: WriteAheadLog,
    events: mpsc::UnboundedSender<StoreEvent>,
}

impl Writer {
    fn start(
        room: String,
        key: RoomKey,
        config: StoreConfig,
        wal: WalConfig,
        events: mpsc::UnboundedSender<StoreEvent>,
    ) -> Self {
        let (medium, unavailable) = match RoomStore::open(config.for_room(key)) {
            Ok(store) => (Medium::Durable(store), None),
            Err(e) => (Medium::Volatile, Some(e.to_string())),
        };
        Self {
            room,
            key,
            medium,
            unavailable,
            wal: WriteAheadLog::new(wal, key),
            events,
        }
    }

    fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        'recv: while let Some(first) = commands.blocking_recv() {
            let mut next = Some(first);
            while let Some(command) = next {
                if matches!(command, Command::Close) {
                    break 'recv;
                }
                self.handle(command);
                next = commands.try_recv().ok();
            }
            // Queue drained: write whatever is buffered
            self.flush_buffer();
        }
        self.shutdown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Load(callback) => self.load(callback),
            Command::Append(record) => self.append(record),
            Command::Snapshot(record) => self.snapshot(record),
            Command::Wipe => self.wipe(),
            Command::Flush(ack) => {
                self.flush_buffer();
                if let Medium::Durable(store) = &self.medium {
                    if let Err(e) = store.sync() {
                        self.fail(e.to_string());
                    }
                }
                let _ = ack.send(());
            }
            Command::Close => {}
        }
    }

    fn load(&mut self, callback: LoadCallback) {
        let result = match &self.medium {
            Medium::Durable(store) => read_log(store, self.key),
            _ => LoadResult::Unavailable(
                self.unavailable
                    .clone()
                    .unwrap_or_else(|| "store not available".to_string()),
            ),
        };

        let failure = match &result {
            LoadResult::Loaded(log) => {
                log::info!(
                    "room `{}`: loaded {} deltas on top of snapshot v{}",
                    self.room,
                    log.commits.len(),
                    log.base_version()
                );
                None
            }
            LoadResult::Corrupt(e) => Some(StoreEvent::DecodeFailed(e.clone())),
            LoadResult::Unavailable(reason) => Some(StoreEvent::Unavailable {
                reason: reason.clone(),
            }),
        };

        let replay = callback(result);

        match failure {
            Some(StoreEvent::Unavailable { reason }) => {
                log::warn!("room `{}` is volatile: {reason}", self.room);
                self.medium = Medium::Volatile;
                self.emit(StoreEvent::Unavailable { reason });
            }
            Some(event) => {
                log::error!("room `{}`: persisted log is corrupted", self.room);
                self.halt();
                self.emit(event);
            }
            None => {
                if let Err(e) = replay {
                    log::error!("room `{}`: replay failed: {e}", self.room);
                    self.halt();
                    self.emit(StoreEvent::DecodeFailed(e));
                }
            }
        }
    }

    fn append(&mut self, record: CommitRecord) {
        if !matches!(self.medium, Medium::Durable(_)) {
            return;
        }
        let version = record.version;
        let bytes = match encode(&record) {
            Ok(bytes) => bytes,
            Err(reason) => return self.fail(reason),
        };
        match self.wal.append_delta(version, bytes) {
            Ok(true) => self.flush_buffer(),
            Ok(false) => {}
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn snapshot(&mut self, record: SnapshotRecord) {
        if !matches!(self.medium, Medium::Durable(_)) {
            return;
        }
        self.flush_buffer();
        let version = record.version;
        let entry = match encode(&record)
            .and_then(|bytes| self.wal.snapshot_entry(version, bytes).map_err(|e| e.to_string()))
        {
            Ok(entry) => entry,
            Err(reason) => return self.fail(reason),
        };
        let Medium::Durable(store) = &self.medium else {
            return;
        };
        match store.save_snapshot(self.key, &entry) {
            Ok(meta) => {
                log::info!(
                    "room `{}` compacted at v{version} ({} bytes)",
                    self.room,
                    meta.compressed_size
                );
                self.emit(StoreEvent::Compacted { version });
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn wipe(&mut self) {
        let dropped = self.wal.discard();
        if dropped > 0 {
            log::debug!("room `{}`: discarded {dropped} buffered commits", self.room);
        }
        let medium = std::mem::replace(&mut self.medium, Medium::Volatile);
        self.medium = match medium {
            Medium::Durable(store) | Medium::Halted(store) => match store.delete_room(self.key) {
                Ok(()) => Medium::Durable(store),
                Err(e) => {
                    self.fail(e.to_string());
                    return;
                }
            },
            Medium::Volatile => Medium::Volatile,
        };
        log::info!("room `{}` wiped", self.room);
        self.emit(StoreEvent::Wiped);
    }

    fn flush_buffer(&mut self) {
        let entries = self.wal.flush();
        if entries.is_empty() {
            return;
        }
        let Medium::Durable(store) = &self.medium else {
            return;
        };
        match store.write_deltas(self.key, &entries) {
            Ok(bytes) => log::debug!(
                "room `{}`: wrote {} commits ({bytes} bytes)",
                self.room,
                entries.len()
            ),
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn halt(&mut self) {
        self.wal.discard();
        self.medium = match std::mem::replace(&mut self.medium, Medium::Volatile) {
            Medium::Durable(store) => Medium::Halted(store),
            other => other,
        };
    }

    fn fail(&mut self, reason: String) {
        log::error!("room `{}`: write failed, continuing volatile: {reason}", self.room);
        self.wal.discard();
        self.medium = Medium::Volatile;
        self.emit(StoreEvent::WriteFailed { reason });
    }

    fn emit(&self, event: StoreEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn shutdown(&mut self) {
        self.flush_buffer();
        if let Medium::Durable(store) = &self.medium {
            if let Err(e) = store.sync() {
                log::warn!("room `{}`: final sync failed: {e}", self.room);
            }
        }
        self.wal.close();
        log::debug!("writer for room `{}` stopped", self.room);
    }
}

fn read_log(store: &RoomStore, key: RoomKey) -> LoadResult {
    let stored = match store.load_room(key) {
        Ok(stored) => stored,
        Err(e) if e.is_corruption() => return LoadResult::Corrupt(DecodeError::Storage(e.to_string())),
        Err(e) => return LoadResult::Unavailable(e.to_string()),
    };
    match decode_log(stored) {
        Ok(log) => LoadResult::Loaded(log),
        Err(e) => LoadResult::Corrupt(e),
    }
}

fn decode_log(stored: StoredRoom) -> Result<LoadedLog, DecodeError> {
    let snapshot = match stored.snapshot {
        Some(entry) => {
            let record: SnapshotRecord = decode(entry.sequence, &entry.payload)?;
            if record.version != entry.sequence {
                return Err(DecodeError::Record {
                    version: entry.sequence,
                    reason: format!("snapshot claims version {}", record.version),
                });
            }
            Some(record)
        }
        None => None,
    };

    let mut commits = Vec::with_capacity(stored.deltas.len());
    for entry in stored.deltas {
        let record: CommitRecord = decode(entry.sequence, &entry.payload)?;
        if record.version != entry.sequence {
            return Err(DecodeError::Record {
                version: entry.sequence,
                reason: format!("commit claims version {}", record.version),
            });
        }
        commits.push(record);
    }

    Ok(LoadedLog { snapshot, commits })
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, String> {
    bincode::serde::encode_to_vec(record, bincode::config::standard()).map_err(|e| e.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(version: u64, bytes: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(record, _)| record)
        .map_err(|e| DecodeError::Record {
            version,
            reason: e.to_string(),
        })
}
