//! Document runtime.
//!
//! A [`Document`] is one room's replicated state plus everything attached
//! to it: the durable writer, the collection handles, the observers and the
//! transaction gate. Opening returns at once in the loading state; the
//! initial sync replays the persisted log on the writer thread and then
//! releases the document:
//!
//! ```text
//! open ──► Loading ──load/replay──► engine swapped in
//!                                    ├─ on_initial_sync callbacks
//!                                    ├─ pending observations get their first snapshot
//!                                    └─ ready() resolves
//! ```
//!
//! Locks are always taken in the order gate → subscriptions → handles →
//! engine.

pub mod handle;
pub mod rooms;
pub mod transaction;

mod dispatch;
mod gate;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tessel_store::{StoreConfig, WalConfig};
use tokio::sync::{mpsc, watch};

use crate::binding::{Observation, Observed, PushCallback, SubscriptionRegistry};
use crate::engine::ops::Staging;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::persist::{
    CommitRecord, DurableStore, LoadResult, SnapshotRecord, StoreEvent, SyncOutcome,
};
use crate::schema::{CollectionKind, Schema};
use dispatch::Dispatcher;
use gate::Gate;
use handle::{Collection, CollectionHandle, MapHandle, SequenceHandle, TextHandle};
use transaction::Transaction;

static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Lock, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Document configuration.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Durable medium; `None` keeps the document in memory only.
    pub store: Option<StoreConfig>,
    /// Commits between full-state snapshots. Default: 100.
    pub compaction_threshold: usize,
    /// Log entries batched per storage write. Default: 64.
    pub flush_batch: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            store: Some(StoreConfig::default()),
            compaction_threshold: 100,
            flush_batch: 64,
        }
    }
}

impl DocumentConfig {
    /// Small caches and frequent snapshots, rooted at `path`.
    pub fn for_testing(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            store: Some(StoreConfig::for_testing(path)),
            compaction_threshold: 8,
            flush_batch: 4,
        }
    }

    pub fn volatile() -> Self {
        Self {
            store: None,
            ..Self::default()
        }
    }

    fn wal_config(&self) -> WalConfig {
        WalConfig {
            max_buffered_entries: self.flush_batch.max(1),
            ..WalConfig::default()
        }
    }
}

type SyncCallback = Box<dyn FnOnce(&Document) + Send>;

enum SyncState {
    Loading(Vec<SyncCallback>),
    Ready,
}

pub(crate) struct Inner {
    pub(crate) id: u64,
    room: String,
    pub(crate) schema: Arc<Schema>,
    config: DocumentConfig,
    gate: Gate,
    pub(crate) engine: Mutex<Engine>,
    pub(crate) subscriptions: Mutex<SubscriptionRegistry>,
    handles: Mutex<HashMap<String, Arc<Collection>>>,
    dispatcher: Dispatcher,
    sync: Mutex<SyncState>,
    synced: AtomicBool,
    outcome: Mutex<Option<SyncOutcome>>,
    /// Flips to true once the document is synced or closed.
    settled: watch::Sender<bool>,
    closed: AtomicBool,
    next_tx: AtomicU64,
    store: Option<DurableStore>,
    unavailable: Option<String>,
    events: Mutex<Option<mpsc::UnboundedReceiver<StoreEvent>>>,
}

impl Inner {
    /// This thread is inside a transaction on this document.
    pub(crate) fn in_transaction(&self) -> bool {
        self.gate.is_held_by_current_thread()
    }

    /// Kick off the initial load. The store answers on its writer thread.
    fn start_sync(self: &Arc<Self>) {
        let Some(store) = &self.store else {
            let reason = self
                .unavailable
                .clone()
                .unwrap_or_else(|| "no durable store configured".to_string());
            self.finish_sync(None, SyncOutcome::Volatile { reason });
            return;
        };

        let doc = Arc::downgrade(self);
        let threshold = self.config.compaction_threshold;
        store.load(Box::new(move |result| {
            let Some(inner) = doc.upgrade() else {
                return Ok(());
            };
            match result {
                LoadResult::Loaded(log) if log.is_empty() => {
                    inner.finish_sync(None, SyncOutcome::Fresh);
                    Ok(())
                }
                LoadResult::Loaded(log) => match Engine::restore(threshold, &log) {
                    Ok(engine) => {
                        let commits = log.head_version();
                        inner.finish_sync(Some(engine), SyncOutcome::Restored { commits });
                        Ok(())
                    }
                    Err(error) => {
                        inner.finish_sync(
                            None,
                            SyncOutcome::RecoveredEmpty {
                                error: error.clone(),
                            },
                        );
                        Err(error)
                    }
                },
                LoadResult::Corrupt(error) => {
                    inner.finish_sync(None, SyncOutcome::RecoveredEmpty { error });
                    Ok(())
                }
                LoadResult::Unavailable(reason) => {
                    inner.finish_sync(None, SyncOutcome::Volatile { reason });
                    Ok(())
                }
            }
        }));
    }

    /// Install the loaded state and release everything waiting on it.
    pub(crate) fn finish_sync(self: &Arc<Self>, engine: Option<Engine>, outcome: SyncOutcome) {
        if let Some(engine) = engine {
            *lock(&self.engine) = engine;
        }
        match &outcome {
            SyncOutcome::Fresh => log::info!("room `{}` opened fresh", self.room),
            SyncOutcome::Restored { commits } => {
                log::info!("room `{}` restored {commits} commits", self.room)
            }
            SyncOutcome::RecoveredEmpty { error } => {
                log::error!("room `{}` recovered empty: {error}", self.room)
            }
            SyncOutcome::Volatile { reason } => {
                log::warn!("room `{}` is volatile: {reason}", self.room)
            }
        }
        *lock(&self.outcome) = Some(outcome);
        self.synced.store(true, Ordering::Release);

        let callbacks = match std::mem::replace(&mut *lock(&self.sync), SyncState::Ready) {
            SyncState::Loading(callbacks) => callbacks,
            SyncState::Ready => Vec::new(),
        };
        let doc = Document::from_inner(self.clone());
        for callback in callbacks {
            callback(&doc);
        }

        self.activate_pending();
        self.dispatcher.drain();
        self.settled.send_replace(true);
    }

    /// Give every observation made while loading its first snapshot.
    fn activate_pending(&self) {
        let mut registry = lock(&self.subscriptions);
        registry.live = true;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut engine = lock(&self.engine);
        for subscriber in registry.pending() {
            match engine.snapshot(subscriber.path(), subscriber.kind()) {
                Ok(value) => {
                    subscriber.set_ready(value.clone());
                    self.dispatcher.enqueue(subscriber, value);
                }
                Err(e) => {
                    log::error!(
                        "room `{}`: cannot observe `{}`: {e}",
                        self.room,
                        subscriber.path()
                    );
                    subscriber.deactivate();
                    registry.detach(&subscriber);
                }
            }
        }
    }

    /// Apply a staged transaction and queue its pushes and writes.
    fn commit(&self, staging: Staging) -> Result<()> {
        let ops = staging.into_ops();
        if ops.is_empty() {
            return Ok(());
        }

        let registry = lock(&self.subscriptions);
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(self.room.clone()));
        }
        let mut engine = lock(&self.engine);
        let Some(commit) = engine.apply(&ops)? else {
            return Ok(());
        };

        // Pending observers get the post-sync state when they activate
        for path in commit.touched.iter().filter(|_| registry.live) {
            let Some((kind, subscribers)) = registry.watching(path) else {
                continue;
            };
            let value = match engine.snapshot(path, kind) {
                Ok(value) => value,
                Err(e) => {
                    log::error!("room `{}`: no snapshot of `{path}`: {e}", self.room);
                    continue;
                }
            };
            for subscriber in subscribers.iter().filter(|s| s.is_active()) {
                subscriber.set_ready(value.clone());
                self.dispatcher.enqueue(subscriber.clone(), value.clone());
            }
        }

        if let Some(store) = &self.store {
            store.append(CommitRecord {
                version: commit.version,
                tx: commit.tx,
                update: commit.update,
                state_vector: commit.state_vector,
            });
            if commit.compact {
                let (update, state_vector) = engine.full_state();
                engine.mark_compacted(commit.version);
                store.snapshot(SnapshotRecord {
                    version: commit.version,
                    update,
                    state_vector,
                });
            }
        } else if commit.compact {
            engine.mark_compacted(commit.version);
        }
        Ok(())
    }
}

/// One open room.
///
/// Cheap to clone; every clone refers to the same document.
#[derive(Clone)]
pub struct Document {
    pub(crate) inner: Arc<Inner>,
}

impl Document {
    /// Open `room`. Returns immediately; the persisted state loads in the
    /// background. Use [`Document::ready`] or [`Document::on_initial_sync`]
    /// to wait for it.
    ///
    /// A medium that cannot be opened does not fail the call: the document
    /// runs volatile and a [`StoreEvent::Unavailable`] is emitted.
    pub fn open(room: &str, schema: Arc<Schema>, config: DocumentConfig) -> Self {
        let doc = Self::open_loading(room, schema, config);
        doc.inner.start_sync();
        doc
    }

    /// Open and wait for the initial sync.
    pub async fn open_ready(room: &str, schema: Arc<Schema>, config: DocumentConfig) -> Result<Self> {
        let doc = Self::open(room, schema, config);
        doc.ready().await?;
        Ok(doc)
    }

    /// Build the document without starting the load.
    pub(crate) fn open_loading(room: &str, schema: Arc<Schema>, config: DocumentConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut unavailable = None;
        let store = match &config.store {
            Some(store_config) => match DurableStore::open(
                room,
                store_config.clone(),
                config.wal_config(),
                events_tx.clone(),
            ) {
                Ok(store) => Some(store),
                Err(e) => {
                    let reason = e.to_string();
                    let _ = events_tx.send(StoreEvent::Unavailable {
                        reason: reason.clone(),
                    });
                    unavailable = Some(reason);
                    None
                }
            },
            None => None,
        };

        let (settled, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            id: NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed),
            room: room.to_string(),
            schema,
            engine: Mutex::new(Engine::new(config.compaction_threshold)),
            config,
            gate: Gate::new(),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            handles: Mutex::new(HashMap::new()),
            dispatcher: Dispatcher::new(),
            sync: Mutex::new(SyncState::Loading(Vec::new())),
            synced: AtomicBool::new(false),
            outcome: Mutex::new(None),
            settled,
            closed: AtomicBool::new(false),
            next_tx: AtomicU64::new(1),
            store,
            unavailable,
            events: Mutex::new(Some(events_rx)),
        });
        log::debug!("opening room `{room}`");
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn room(&self) -> &str {
        &self.inner.room
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// How the initial sync ended; `None` while loading.
    pub fn sync_outcome(&self) -> Option<SyncOutcome> {
        lock(&self.inner.outcome).clone()
    }

    /// Take the durability event channel. Only the first call gets it.
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<StoreEvent>> {
        lock(&self.inner.events).take()
    }

    /// Wait for the initial sync.
    pub async fn ready(&self) -> Result<()> {
        let mut settled = self.inner.settled.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us
        let _ = settled.wait_for(|done| *done).await;
        self.ensure_open()?;
        Ok(())
    }

    /// Run `callback` once the initial sync is done, or now if it already is.
    pub fn on_initial_sync<F>(&self, callback: F)
    where
        F: FnOnce(&Document) + Send + 'static,
    {
        {
            let mut sync = lock(&self.inner.sync);
            if let SyncState::Loading(callbacks) = &mut *sync {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(self.inner.room.clone()));
        }
        Ok(())
    }

    fn ensure_synced(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.is_synced() {
            return Err(Error::NotSynced(self.inner.room.clone()));
        }
        Ok(())
    }

    /// Handle to the collection at `path`, created on first use.
    ///
    /// Repeated calls with the same path and kind return the same
    /// collection; a different kind is an error.
    pub fn collection(&self, path: &str, kind: CollectionKind) -> Result<CollectionHandle> {
        self.ensure_synced()?;
        self.inner.schema.check(path, kind)?;

        let mut handles = lock(&self.inner.handles);
        if let Some(existing) = handles.get(path) {
            if existing.kind() != kind {
                return Err(Error::KindMismatch {
                    path: path.to_string(),
                    existing: existing.kind(),
                    requested: kind,
                });
            }
            return Ok(CollectionHandle::from_collection(existing.clone()));
        }

        lock(&self.inner.engine).materialize(path, kind)?;
        let collection = Arc::new(Collection::new(
            Arc::downgrade(&self.inner),
            self.inner.id,
            path,
            kind,
        ));
        handles.insert(path.to_string(), collection.clone());
        log::debug!("room `{}`: materialized {kind} `{path}`", self.inner.room);
        Ok(CollectionHandle::from_collection(collection))
    }

    pub fn sequence(&self, path: &str) -> Result<SequenceHandle> {
        match self.collection(path, CollectionKind::Sequence)? {
            CollectionHandle::Sequence(handle) => Ok(handle),
            other => Err(mismatch(path, other.kind(), CollectionKind::Sequence)),
        }
    }

    pub fn map(&self, path: &str) -> Result<MapHandle> {
        match self.collection(path, CollectionKind::Map)? {
            CollectionHandle::Map(handle) => Ok(handle),
            other => Err(mismatch(path, other.kind(), CollectionKind::Map)),
        }
    }

    pub fn text(&self, path: &str) -> Result<TextHandle> {
        match self.collection(path, CollectionKind::Text)? {
            CollectionHandle::Text(handle) => Ok(handle),
            other => Err(mismatch(path, other.kind(), CollectionKind::Text)),
        }
    }

    pub(crate) fn snapshot_path(&self, path: &str, kind: CollectionKind) -> Result<Value> {
        lock(&self.inner.engine).snapshot(path, kind)
    }

    /// Run `f` as one atomic transaction.
    ///
    /// Transactions on a document run one at a time in call order. If `f`
    /// returns `Err` (or panics) nothing it staged is committed or observed.
    /// Observers are notified after the commit, once per touched path.
    /// If another thread is already delivering notifications, this call
    /// returns without waiting and that thread delivers ours too.
    pub fn transact<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, E>,
        E: From<Error>,
    {
        self.ensure_open()?;
        let guard = self.inner.gate.enter()?;
        let id = self.inner.next_tx.fetch_add(1, Ordering::Relaxed);

        let mut tx = Transaction::new(self, id);
        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                log::debug!("room `{}`: tx {id} rolled back", self.inner.room);
                return Err(e);
            }
        };
        self.inner.commit(tx.into_staging())?;
        drop(guard);

        self.inner.dispatcher.drain();
        Ok(value)
    }

    /// Observe `path` as `kind`.
    ///
    /// Before the initial sync the observation is [`Observed::Pending`]; it
    /// receives its first snapshot as a push once loading finishes.
    pub fn observe(&self, path: &str, kind: CollectionKind) -> Result<Observation> {
        self.attach(path, kind, None)
    }

    /// Like [`Document::observe`], calling `callback` with every pushed
    /// snapshot. Callbacks may start new transactions.
    ///
    /// Callbacks run on whichever thread is draining the notification queue.
    /// That is usually the committing thread, but when another thread is
    /// mid-drain it takes over the delivery, and the callback can run after
    /// the committing [`Document::transact`] has already returned. Pushes to
    /// one observer still arrive in commit order.
    pub fn observe_with<F>(&self, path: &str, kind: CollectionKind, callback: F) -> Result<Observation>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.attach(path, kind, Some(Box::new(callback)))
    }

    fn attach(
        &self,
        path: &str,
        kind: CollectionKind,
        callback: Option<PushCallback>,
    ) -> Result<Observation> {
        self.ensure_open()?;
        self.inner.schema.check(path, kind)?;

        let mut registry = lock(&self.inner.subscriptions);
        let initial = if registry.live {
            Observed::Ready(lock(&self.inner.engine).snapshot(path, kind)?)
        } else {
            Observed::Pending
        };
        let subscriber = registry.attach(path, kind, initial, callback)?;
        Ok(Observation::new(Arc::downgrade(&self.inner), subscriber))
    }

    /// Last committed version.
    pub fn version(&self) -> u64 {
        lock(&self.inner.engine).version()
    }

    /// Paths with at least one attached observer.
    pub fn observed_paths(&self) -> usize {
        lock(&self.inner.subscriptions).listener_count()
    }

    /// Block until every commit so far has reached storage.
    pub fn flush(&self) {
        if let Some(store) = &self.inner.store {
            store.flush();
        }
    }

    /// Remove all content, in memory and in storage.
    ///
    /// Observers get a push with their emptied collection. A room whose log
    /// failed to load resumes durable writes after a wipe.
    pub fn wipe(&self) -> Result<()> {
        self.ensure_synced()?;
        let guard = self.inner.gate.enter()?;
        {
            let registry = lock(&self.inner.subscriptions);
            let mut engine = lock(&self.inner.engine);
            engine.reset();
            for (path, kind) in registry.paths() {
                let value = engine.snapshot(&path, kind)?;
                if let Some((_, subscribers)) = registry.watching(&path) {
                    for subscriber in subscribers {
                        subscriber.set_ready(value.clone());
                        self.inner
                            .dispatcher
                            .enqueue(subscriber.clone(), value.clone());
                    }
                }
            }
            if let Some(store) = &self.inner.store {
                store.wipe();
            }
        }
        drop(guard);
        log::info!("room `{}` wiped", self.inner.room);
        self.inner.dispatcher.drain();
        Ok(())
    }

    /// Detach every observer, drop the handles and flush the store.
    ///
    /// Writes already queued still land. Safe to call more than once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let detached = lock(&self.inner.subscriptions).clear();
        lock(&self.inner.handles).clear();
        if let Some(store) = &self.inner.store {
            store.close();
        }
        self.inner.settled.send_replace(true);
        log::info!(
            "room `{}` closed ({detached} observers detached)",
            self.inner.room
        );
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("room", &self.inner.room)
            .field("synced", &self.is_synced())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn mismatch(path: &str, existing: CollectionKind, requested: CollectionKind) -> Error {
    Error::KindMismatch {
        path: path.to_string(),
        existing,
        requested,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    /// Volatile document, already synced.
    pub(crate) fn synced(schema: Schema) -> Document {
        let doc = Document::open_loading("test", Arc::new(schema), DocumentConfig::volatile());
        doc.inner.finish_sync(None, SyncOutcome::Fresh);
        doc
    }

    fn loading(schema: Schema) -> Document {
        Document::open_loading("test", Arc::new(schema), DocumentConfig::volatile())
    }

    #[test]
    fn test_volatile_open_is_synced() {
        let doc = Document::open("v", Arc::new(Schema::permissive()), DocumentConfig::volatile());
        assert!(doc.is_synced());
        assert!(matches!(doc.sync_outcome(), Some(SyncOutcome::Volatile { .. })));
    }

    #[test]
    fn test_pending_before_sync() {
        let doc = loading(Schema::permissive());
        let notes = doc.observe("notes", CollectionKind::Sequence).unwrap();
        assert_eq!(notes.current(), Observed::Pending);
        assert!(matches!(doc.sequence("notes"), Err(Error::NotSynced(_))));
        assert!(matches!(notes.handle(), Err(Error::NotSynced(_))));

        doc.inner.finish_sync(None, SyncOutcome::Fresh);
        assert_eq!(notes.current(), Observed::Ready(json!([])));
        assert_eq!(notes.push_count(), 1);
        assert!(notes.handle().unwrap().as_sequence().is_some());
    }

    #[test]
    fn test_sync_callbacks_run_before_activation() {
        let doc = loading(Schema::permissive());
        let notes = doc.observe("notes", CollectionKind::Sequence).unwrap();
        doc.on_initial_sync(|doc| {
            doc.sequence("notes")
                .unwrap()
                .push(json!({"id": "n1", "title": "New Note"}))
                .unwrap();
        });
        doc.inner.finish_sync(None, SyncOutcome::Fresh);

        // The seed is part of the first snapshot, not a separate push
        assert_eq!(notes.push_count(), 1);
        assert_eq!(
            notes.current().into_value(),
            Some(json!([{"id": "n1", "title": "New Note"}]))
        );

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        doc.on_initial_sync(move |_| flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_kind_mismatch_is_immediate() {
        let doc = synced(Schema::permissive());
        doc.sequence("notes").unwrap();
        assert!(matches!(doc.map("notes"), Err(Error::KindMismatch { .. })));
        assert!(matches!(
            doc.observe("notes", CollectionKind::Text),
            Err(Error::KindMismatch { .. })
        ));
        assert!(matches!(
            doc.text(crate::engine::KINDS_ROOT),
            Err(Error::ReservedPath(_))
        ));
    }

    #[test]
    fn test_strict_schema_rejects_undeclared() {
        let schema = Schema::builder().sequence("notes").strict(true).build().unwrap();
        let doc = synced(schema);
        assert!(doc.sequence("notes").is_ok());
        assert!(matches!(doc.sequence("other"), Err(Error::UndeclaredPath(_))));
        assert!(matches!(doc.map("notes"), Err(Error::KindMismatch { .. })));
    }

    #[test]
    fn test_one_push_per_transaction() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        let title = doc.text("title").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let seen = doc
            .observe_with("notes", CollectionKind::Sequence, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let other = doc.observe("title", CollectionKind::Text).unwrap();

        doc.transact(|tx| {
            let mut seq = tx.sequence(&notes)?;
            seq.push(json!(1));
            seq.push(json!(2));
            seq.delete_range(0, 1);
            Ok::<_, Error>(())
        })
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.push_count(), 1);
        assert_eq!(seen.current().into_value(), Some(json!([2])));
        // Untouched path: no push
        assert_eq!(other.push_count(), 0);

        title.push_str("x").unwrap();
        assert_eq!(other.push_count(), 1);
        assert_eq!(seen.push_count(), 1);
    }

    #[test]
    fn test_detach_stops_pushes() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        let obs = doc.observe("notes", CollectionKind::Sequence).unwrap();
        assert_eq!(doc.observed_paths(), 1);

        notes.push(json!(1)).unwrap();
        obs.detach();
        notes.push(json!(2)).unwrap();
        assert_eq!(obs.push_count(), 1);
        assert_eq!(obs.current().into_value(), Some(json!([1])));
        assert_eq!(doc.observed_paths(), 0);
        assert!(matches!(obs.handle(), Err(Error::Detached(_))));

        let dropped = doc.observe("notes", CollectionKind::Sequence).unwrap();
        drop(dropped);
        assert_eq!(doc.observed_paths(), 0);
    }

    #[test]
    fn test_reentrant_transaction_is_rejected() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        let err = doc
            .transact(|_| notes.push(json!(1)))
            .unwrap_err();
        assert_eq!(err, Error::ReentrantTransaction);
        assert!(notes.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_observer_may_transact() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        let log = doc.sequence("log").unwrap();
        let sink = log.clone();
        let _obs = doc
            .observe_with("notes", CollectionKind::Sequence, move |value| {
                let len = value.as_array().map(|a| a.len()).unwrap_or(0);
                sink.push(json!(len)).unwrap();
            })
            .unwrap();

        notes.push(json!("a")).unwrap();
        notes.push(json!("b")).unwrap();
        assert_eq!(log.snapshot().unwrap(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_last_set_wins() {
        let doc = synced(Schema::permissive());
        let meta = doc.map("meta").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _obs = doc
            .observe_with("meta", CollectionKind::Map, move |v| {
                sink.lock().unwrap().push(v["title"].clone());
            })
            .unwrap();

        meta.set("title", json!("A")).unwrap();
        meta.set("title", json!("B")).unwrap();
        assert_eq!(meta.get("title").unwrap(), Some(json!("B")));
        assert_eq!(*seen.lock().unwrap(), vec![json!("A"), json!("B")]);
    }

    #[test]
    fn test_close_invalidates() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        let obs = doc.observe("notes", CollectionKind::Sequence).unwrap();
        doc.close();
        doc.close();

        assert!(!obs.is_attached());
        assert!(matches!(doc.sequence("notes"), Err(Error::Closed(_))));
        assert!(matches!(
            doc.transact(|_| Ok::<_, Error>(())),
            Err(Error::Closed(_))
        ));
        assert!(notes.push(json!(1)).is_err());
        assert_eq!(obs.push_count(), 0);
    }

    #[test]
    fn test_wipe_pushes_empty_state() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        notes.push(json!(1)).unwrap();
        let obs = doc.observe("notes", CollectionKind::Sequence).unwrap();

        doc.wipe().unwrap();
        assert_eq!(obs.current().into_value(), Some(json!([])));
        assert_eq!(obs.push_count(), 1);
        assert_eq!(doc.version(), 0);

        // Kinds survive a wipe
        assert!(matches!(doc.map("notes"), Err(Error::KindMismatch { .. })));
        notes.push(json!(2)).unwrap();
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn test_busy_drain_delivers_for_other_thread() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        let title = doc.text("title").unwrap();
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let (e, r) = (entered.clone(), release.clone());
        let _blocking = doc
            .observe_with("notes", CollectionKind::Sequence, move |_| {
                e.wait();
                r.wait();
            })
            .unwrap();
        let ran_on = Arc::new(Mutex::new(Vec::new()));
        let sink = ran_on.clone();
        let titles = doc
            .observe_with("title", CollectionKind::Text, move |_| {
                sink.lock().unwrap().push(std::thread::current().id());
            })
            .unwrap();

        let drainer = std::thread::spawn(move || {
            notes.push(json!(1)).unwrap();
            std::thread::current().id()
        });
        entered.wait();
        title.push_str("x").unwrap();
        // Committed and returned, but the other thread owns delivery
        assert_eq!(titles.push_count(), 0);
        assert!(ran_on.lock().unwrap().is_empty());

        release.wait();
        let drainer_id = drainer.join().unwrap();
        assert_eq!(*ran_on.lock().unwrap(), vec![drainer_id]);
        assert_eq!(titles.push_count(), 1);
    }

    #[test]
    fn test_detach_waits_for_running_callback() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        let entered = Arc::new(Barrier::new(2));
        let finished = Arc::new(AtomicBool::new(false));
        let (e, f) = (entered.clone(), finished.clone());
        let obs = doc
            .observe_with("notes", CollectionKind::Sequence, move |_| {
                e.wait();
                std::thread::sleep(Duration::from_millis(50));
                f.store(true, Ordering::SeqCst);
            })
            .unwrap();

        let drainer = std::thread::spawn(move || notes.push(json!(1)).unwrap());
        entered.wait();
        obs.detach();
        assert!(finished.load(Ordering::SeqCst));
        drainer.join().unwrap();
    }

    #[test]
    fn test_detach_inside_transaction_does_not_wait() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        let log = doc.sequence("log").unwrap();
        let entered = Arc::new(Barrier::new(2));
        let e = entered.clone();
        let sink = log.clone();
        let obs = doc
            .observe_with("notes", CollectionKind::Sequence, move |_| {
                e.wait();
                // Needs the gate the detaching thread holds
                sink.push(json!("seen")).unwrap();
            })
            .unwrap();

        let drainer = std::thread::spawn(move || notes.push(json!(1)).unwrap());
        doc.transact(|_| {
            entered.wait();
            obs.detach();
            Ok::<_, Error>(())
        })
        .unwrap();
        drainer.join().unwrap();

        assert!(!obs.is_attached());
        assert_eq!(log.snapshot().unwrap(), vec![json!("seen")]);
    }

    #[test]
    fn test_transactions_serialize_across_threads() {
        let doc = synced(Schema::permissive());
        let counter = doc.map("counter").unwrap();
        counter.set("n", json!(0)).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let doc = doc.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        doc.transact(|tx| {
                            let mut map = tx.map(&counter)?;
                            let n = map.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                            map.set("n", json!(n + 1))
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(counter.get("n").unwrap(), Some(json!(100)));
        assert_eq!(doc.version(), 101);
    }
}
