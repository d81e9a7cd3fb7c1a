//! Conflict-free collection engine.
//!
//! Every collection path is one `yrs` root type: sequences are `ArrayRef`s,
//! maps are `MapRef`s and texts are `TextRef`s. Item identity, merge order and
//! tombstones come from the `yrs` block store. On top of that the engine
//! adds:
//! - a kind registry, persisted inside the document, so a path keeps its
//!   kind across restarts
//! - commit of a staged operation batch as one `yrs` transaction, producing
//!   one v1 update plus the resulting state vector
//! - strict replay of a persisted log
//!
//! ```text
//!   Staging (ops) ──apply──► TransactionMut ──► update_v1 + state vector
//!                                                   │
//!   LoadedLog ──restore──► fresh Doc ──verify sv────┘
//! ```

pub mod ops;
pub mod value;

use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use tessel_store::DeltaLog;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, Text, TextRef,
    Transact, TransactionMut, Update,
};

use crate::error::{DecodeError, Error, Result};
use crate::persist::LoadedLog;
use crate::schema::CollectionKind;
use ops::{Operation, TxId};

/// Root map recording the kind of every path that has been written.
pub const KINDS_ROOT: &str = "tessel:kinds";

#[derive(Clone)]
enum Root {
    Sequence(ArrayRef),
    Map(MapRef),
    Text(TextRef),
}

impl Root {
    fn kind(&self) -> CollectionKind {
        match self {
            Root::Sequence(_) => CollectionKind::Sequence,
            Root::Map(_) => CollectionKind::Map,
            Root::Text(_) => CollectionKind::Text,
        }
    }
}

/// Result of committing one transaction.
#[derive(Debug, Clone)]
pub struct Commit {
    pub version: u64,
    pub tx: TxId,
    /// `yrs` v1 update holding exactly this transaction's changes
    pub update: Vec<u8>,
    /// Encoded state vector after the commit
    pub state_vector: Vec<u8>,
    pub touched: BTreeSet<String>,
    /// Enough commits piled up since the last snapshot
    pub compact: bool,
}

/// The document's replicated state.
pub struct Engine {
    doc: Doc,
    kinds_root: MapRef,
    roots: HashMap<String, Root>,
    kinds: HashMap<String, CollectionKind>,
    recorded: HashSet<String>,
    log: DeltaLog,
}

impl Engine {
    pub fn new(compaction_threshold: usize) -> Self {
        let doc = Doc::new();
        let kinds_root = doc.get_or_insert_map(KINDS_ROOT);
        Self {
            doc,
            kinds_root,
            roots: HashMap::new(),
            kinds: HashMap::new(),
            recorded: HashSet::new(),
            log: DeltaLog::new(compaction_threshold),
        }
    }

    /// Rebuild a document from a persisted log.
    ///
    /// Replays into a fresh `Doc`; the result is only returned when every
    /// update decoded, applied and the final state vector matches the one
    /// recorded with the last entry.
    pub fn restore(compaction_threshold: usize, log: &LoadedLog) -> Result<Self, DecodeError> {
        let mut engine = Engine::new(compaction_threshold);
        let mut expected: Option<(u64, &[u8])> = None;

        {
            let mut txn = engine.doc.transact_mut();
            if let Some(snapshot) = &log.snapshot {
                apply_update(&mut txn, snapshot.version, &snapshot.update)?;
                expected = Some((snapshot.version, snapshot.state_vector.as_slice()));
            }
            for commit in &log.commits {
                apply_update(&mut txn, commit.version, &commit.update)?;
                expected = Some((commit.version, commit.state_vector.as_slice()));
            }
        }

        if let Some((version, recorded)) = expected {
            let recorded = StateVector::decode_v1(recorded).map_err(|e| DecodeError::Record {
                version,
                reason: format!("state vector: {e}"),
            })?;
            let actual = engine.doc.transact().state_vector();
            if actual != recorded {
                return Err(DecodeError::Incomplete { version });
            }
        }

        engine.load_kinds();
        engine.log = DeltaLog::restore(compaction_threshold, log.base_version(), log.head_version());
        Ok(engine)
    }

    fn load_kinds(&mut self) {
        let stored: Vec<(String, String)> = {
            let txn = self.doc.transact();
            self.kinds_root
                .iter(&txn)
                .filter_map(|(path, out)| match out {
                    Out::Any(Any::String(kind)) => Some((path.to_string(), kind.to_string())),
                    _ => None,
                })
                .collect()
        };
        for (path, kind) in stored {
            match kind.parse::<CollectionKind>() {
                Ok(kind) => {
                    self.kinds.insert(path.clone(), kind);
                    self.recorded.insert(path);
                }
                Err(unknown) => log::warn!("ignoring unknown kind `{unknown}` recorded for `{path}`"),
            }
        }
    }

    /// Last committed version.
    pub fn version(&self) -> u64 {
        self.log.version()
    }

    pub fn kind_of(&self, path: &str) -> Option<CollectionKind> {
        self.kinds.get(path).copied()
    }

    /// Bind `path` to a root of `kind`, creating it if needed.
    pub fn materialize(&mut self, path: &str, kind: CollectionKind) -> Result<()> {
        if path == KINDS_ROOT {
            return Err(Error::ReservedPath(path.to_string()));
        }
        if let Some(existing) = self.kinds.get(path) {
            if *existing != kind {
                return Err(Error::KindMismatch {
                    path: path.to_string(),
                    existing: *existing,
                    requested: kind,
                });
            }
        }
        if !self.roots.contains_key(path) {
            let root = match kind {
                CollectionKind::Sequence => Root::Sequence(self.doc.get_or_insert_array(path)),
                CollectionKind::Map => Root::Map(self.doc.get_or_insert_map(path)),
                CollectionKind::Text => Root::Text(self.doc.get_or_insert_text(path)),
            };
            self.roots.insert(path.to_string(), root);
            self.kinds.insert(path.to_string(), kind);
        }
        Ok(())
    }

    /// Deep copy of the collection at `path` as a plain value.
    pub fn snapshot(&mut self, path: &str, kind: CollectionKind) -> Result<Value> {
        self.materialize(path, kind)?;
        let txn = self.doc.transact();
        let value = match self.roots.get(path) {
            Some(Root::Sequence(array)) => {
                Value::Array(array.iter(&txn).map(|out| out_to_value(&out)).collect())
            }
            Some(Root::Map(map)) => Value::Object(
                map.iter(&txn)
                    .map(|(key, out)| (key.to_string(), out_to_value(&out)))
                    .collect(),
            ),
            Some(Root::Text(text)) => Value::String(text.get_string(&txn)),
            None => Value::Null,
        };
        Ok(value)
    }

    /// Apply a staged batch as one commit. An empty batch commits nothing.
    pub fn apply(&mut self, ops: &[Operation]) -> Result<Option<Commit>> {
        let Some(first) = ops.first() else {
            return Ok(None);
        };
        let tx = first.tx();
        for op in ops {
            self.materialize(op.path(), op.kind())?;
        }

        let touched: BTreeSet<String> = ops.iter().map(|op| op.path().to_string()).collect();
        let unrecorded: Vec<String> = touched
            .iter()
            .filter(|path| !self.recorded.contains(*path))
            .cloned()
            .collect();

        let update = {
            let mut txn = self.doc.transact_mut();
            for path in &unrecorded {
                if let Some(root) = self.roots.get(path) {
                    self.kinds_root
                        .insert(&mut txn, path.as_str(), root.kind().as_str());
                }
            }
            for op in ops {
                self.apply_op(&mut txn, op);
            }
            txn.encode_update_v1()
        };
        self.recorded.extend(unrecorded);

        let state_vector = self.doc.transact().state_vector().encode_v1();
        let (version, compact) = self.log.append(update.len());
        log::debug!(
            "commit v{version} (tx {tx}): {} ops, {} bytes",
            ops.len(),
            update.len()
        );

        Ok(Some(Commit {
            version,
            tx,
            update,
            state_vector,
            touched,
            compact,
        }))
    }

    fn apply_op(&self, txn: &mut TransactionMut, op: &Operation) {
        match (op, self.roots.get(op.path())) {
            (Operation::Insert { index, values, .. }, Some(Root::Sequence(array))) => {
                let len = array.len(&*txn);
                let index = (*index as u32).min(len);
                array.insert_range(txn, index, values.iter().map(value::to_any));
            }
            (Operation::Delete { index, len, .. }, Some(Root::Sequence(array))) => {
                let live = array.len(&*txn);
                let index = *index as u32;
                if index < live {
                    let len = (*len as u32).min(live - index);
                    array.remove_range(txn, index, len);
                }
            }
            (Operation::Set { key, value, .. }, Some(Root::Map(map))) => {
                map.insert(txn, key.as_str(), value::to_any(value));
            }
            (Operation::Remove { key, .. }, Some(Root::Map(map))) => {
                map.remove(txn, key);
            }
            (
                Operation::Splice {
                    index,
                    delete,
                    insert,
                    ..
                },
                Some(Root::Text(text)),
            ) => {
                // Default document offsets are UTF-8 bytes
                let current = text.get_string(&*txn);
                let start = byte_offset(&current, *index);
                let end = byte_offset(&current, index + delete);
                if end > start {
                    text.remove_range(txn, start as u32, (end - start) as u32);
                }
                if !insert.is_empty() {
                    text.insert(txn, start as u32, insert);
                }
            }
            (op, _) => log::error!("dropping {:?} on `{}`: kind changed", op.kind(), op.path()),
        }
    }

    /// Full document state as an update plus its state vector.
    pub fn full_state(&self) -> (Vec<u8>, Vec<u8>) {
        let txn = self.doc.transact();
        (
            txn.encode_state_as_update_v1(&StateVector::default()),
            txn.state_vector().encode_v1(),
        )
    }

    /// A snapshot now covers everything up to `version`.
    pub fn mark_compacted(&mut self, version: u64) {
        match self.log.mark_compacted(version) {
            Ok(folded) => log::debug!(
                "snapshot at v{version} folds {} deltas ({} bytes) over base v{}",
                folded.delta_count,
                folded.total_original_bytes,
                folded.base_version
            ),
            Err(e) => log::warn!("compaction bookkeeping: {e}"),
        }
    }

    /// Drop all content. Materialized paths keep their kinds.
    pub fn reset(&mut self) {
        let materialized: Vec<(String, CollectionKind)> = self
            .roots
            .iter()
            .map(|(path, root)| (path.clone(), root.kind()))
            .collect();

        self.doc = Doc::new();
        self.kinds_root = self.doc.get_or_insert_map(KINDS_ROOT);
        self.roots.clear();
        self.kinds.clear();
        self.recorded.clear();
        self.log.reset();

        for (path, kind) in materialized {
            // Kinds were consistent before the reset
            let _ = self.materialize(&path, kind);
        }
    }
}

fn apply_update(txn: &mut TransactionMut, version: u64, bytes: &[u8]) -> Result<(), DecodeError> {
    let update = Update::decode_v1(bytes).map_err(|e| DecodeError::Update {
        version,
        reason: e.to_string(),
    })?;
    txn.apply_update(update).map_err(|e| DecodeError::Apply {
        version,
        reason: e.to_string(),
    })
}

fn out_to_value(out: &Out) -> Value {
    match out {
        Out::Any(any) => value::from_any(any),
        _ => Value::Null,
    }
}

/// Byte offset of char `index`, clamped to the end.
fn byte_offset(s: &str, index: usize) -> usize {
    s.char_indices().nth(index).map(|(b, _)| b).unwrap_or(s.len())
}
