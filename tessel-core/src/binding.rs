//! Reactive binding layer: live snapshots of collection paths.
//!
//! An [`Observation`] is an explicit subscription object. While attached it
//! holds the latest plain snapshot of its path and receives exactly one push
//! per commit touching that path. Dropping it (or calling
//! [`Observation::detach`]) unregisters it; no push is delivered afterwards.
//!
//! Before the document's initial sync an observation reports
//! [`Observed::Pending`], never an empty collection.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use crate::error::{Error, Result};
use crate::runtime::handle::CollectionHandle;
use crate::runtime::{lock, Document, Inner};
use crate::schema::CollectionKind;

/// Current state of an observed path.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    /// The document has not finished loading.
    Pending,
    Ready(Value),
}

impl Observed {
    pub fn is_pending(&self) -> bool {
        matches!(self, Observed::Pending)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Observed::Ready(value) => Some(value),
            Observed::Pending => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Observed::Ready(value) => Some(value),
            Observed::Pending => None,
        }
    }
}

pub(crate) type PushCallback = Box<dyn Fn(&Value) + Send + Sync>;

/// One registered observer.
pub(crate) struct Subscriber {
    id: u64,
    path: String,
    kind: CollectionKind,
    state: Mutex<Observed>,
    pushes: AtomicU64,
    active: AtomicBool,
    /// Thread currently inside `callback`, if any.
    delivering: Mutex<Option<ThreadId>>,
    delivered: Condvar,
    callback: Option<PushCallback>,
}

impl Subscriber {
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn is_pending(&self) -> bool {
        lock(&self.state).is_pending()
    }

    pub(crate) fn set_ready(&self, value: Value) {
        *lock(&self.state) = Observed::Ready(value);
    }

    /// Mark detached. Returns false if it already was.
    ///
    /// No delivery starts once this returns; one already inside the callback
    /// runs to completion (see [`Subscriber::settle`]).
    pub(crate) fn deactivate(&self) -> bool {
        let _running = lock(&self.delivering);
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Block until no other thread is inside the callback.
    pub(crate) fn settle(&self) {
        let me = thread::current().id();
        let mut running = lock(&self.delivering);
        while running.is_some_and(|owner| owner != me) {
            running = self
                .delivered
                .wait(running)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Hand one pushed snapshot to the consumer.
    pub(crate) fn deliver(&self, value: &Value) {
        {
            let mut running = lock(&self.delivering);
            if !self.is_active() {
                return;
            }
            *running = Some(thread::current().id());
        }
        let _done = Delivered(self);
        self.pushes.fetch_add(1, Ordering::AcqRel);
        if let Some(callback) = &self.callback {
            callback(value);
        }
    }
}

/// Clears the delivering mark, also when the callback panics.
struct Delivered<'a>(&'a Subscriber);

impl Drop for Delivered<'_> {
    fn drop(&mut self) {
        *lock(&self.0.delivering) = None;
        self.0.delivered.notify_all();
    }
}

struct PathEntry {
    kind: CollectionKind,
    subscribers: Vec<Arc<Subscriber>>,
}

/// Observers of one document, grouped by path.
///
/// A path has an entry only while at least one observer is attached to it.
pub(crate) struct SubscriptionRegistry {
    /// Initial sync finished; new subscribers start ready.
    pub(crate) live: bool,
    next_id: u64,
    paths: HashMap<String, PathEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            live: false,
            next_id: 0,
            paths: HashMap::new(),
        }
    }

    pub(crate) fn attach(
        &mut self,
        path: &str,
        kind: CollectionKind,
        initial: Observed,
        callback: Option<PushCallback>,
    ) -> Result<Arc<Subscriber>> {
        if let Some(entry) = self.paths.get(path) {
            if entry.kind != kind {
                return Err(Error::KindMismatch {
                    path: path.to_string(),
                    existing: entry.kind,
                    requested: kind,
                });
            }
        }
        self.next_id += 1;
        let subscriber = Arc::new(Subscriber {
            id: self.next_id,
            path: path.to_string(),
            kind,
            state: Mutex::new(initial),
            pushes: AtomicU64::new(0),
            active: AtomicBool::new(true),
            delivering: Mutex::new(None),
            delivered: Condvar::new(),
            callback,
        });
        self.paths
            .entry(path.to_string())
            .or_insert_with(|| PathEntry {
                kind,
                subscribers: Vec::new(),
            })
            .subscribers
            .push(subscriber.clone());
        Ok(subscriber)
    }

    pub(crate) fn detach(&mut self, subscriber: &Subscriber) {
        let Some(entry) = self.paths.get_mut(&subscriber.path) else {
            return;
        };
        entry.subscribers.retain(|s| s.id != subscriber.id);
        if entry.subscribers.is_empty() {
            self.paths.remove(&subscriber.path);
        }
    }

    /// Observers of `path` and the kind they observe it as.
    pub(crate) fn watching(&self, path: &str) -> Option<(CollectionKind, &[Arc<Subscriber>])> {
        self.paths
            .get(path)
            .map(|entry| (entry.kind, entry.subscribers.as_slice()))
    }

    pub(crate) fn paths(&self) -> Vec<(String, CollectionKind)> {
        self.paths
            .iter()
            .map(|(path, entry)| (path.clone(), entry.kind))
            .collect()
    }

    pub(crate) fn pending(&self) -> Vec<Arc<Subscriber>> {
        self.paths
            .values()
            .flat_map(|entry| entry.subscribers.iter())
            .filter(|s| s.is_pending())
            .cloned()
            .collect()
    }

    /// Detach everything. Returns how many observers were attached.
    pub(crate) fn clear(&mut self) -> usize {
        let mut count = 0;
        for entry in self.paths.values() {
            for subscriber in &entry.subscribers {
                subscriber.deactivate();
                count += 1;
            }
        }
        self.paths.clear();
        count
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.paths.len()
    }
}

/// Live view of one path of a document.
pub struct Observation {
    doc: Weak<Inner>,
    subscriber: Arc<Subscriber>,
}

impl Observation {
    pub(crate) fn new(doc: Weak<Inner>, subscriber: Arc<Subscriber>) -> Self {
        Self { doc, subscriber }
    }

    pub fn path(&self) -> &str {
        self.subscriber.path()
    }

    pub fn kind(&self) -> CollectionKind {
        self.subscriber.kind()
    }

    /// Latest snapshot, or [`Observed::Pending`] while loading.
    pub fn current(&self) -> Observed {
        lock(&self.subscriber.state).clone()
    }

    /// Mutation handle for the observed path.
    pub fn handle(&self) -> Result<CollectionHandle> {
        if !self.is_attached() {
            return Err(Error::Detached(self.path().to_string()));
        }
        let inner = self
            .doc
            .upgrade()
            .ok_or_else(|| Error::Closed(self.path().to_string()))?;
        Document::from_inner(inner).collection(self.path(), self.kind())
    }

    /// Number of snapshots pushed to this observer.
    ///
    /// An observation created after initial sync starts at 0; one created
    /// before counts its first ready snapshot as a push.
    pub fn push_count(&self) -> u64 {
        self.subscriber.pushes.load(Ordering::Acquire)
    }

    pub fn is_attached(&self) -> bool {
        self.subscriber.is_active()
    }

    /// Stop receiving pushes. Idempotent.
    ///
    /// When this returns the callback will not be called again and is not
    /// running on any other thread. Inside a transaction it returns without
    /// waiting for a callback that is already running. Do not detach while
    /// holding a lock the callback takes.
    pub fn detach(&self) {
        if !self.subscriber.deactivate() {
            return;
        }
        if let Some(inner) = self.doc.upgrade() {
            lock(&inner.subscriptions).detach(&self.subscriber);
            if !inner.in_transaction() {
                self.subscriber.settle();
            }
        }
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("path", &self.subscriber.path)
            .field("kind", &self.subscriber.kind)
            .field("attached", &self.is_attached())
            .finish()
    }
}
