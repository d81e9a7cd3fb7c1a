//! Staged operations and the transaction-local view they are applied to.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::schema::CollectionKind;

/// Identifier of the transaction an operation originated from.
pub type TxId = u64;

/// One atomic change to a collection.
///
/// Indices are already resolved against the transaction's view: they are in
/// range when the operation is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert {
        tx: TxId,
        path: String,
        index: usize,
        values: Vec<Value>,
    },
    Delete {
        tx: TxId,
        path: String,
        index: usize,
        len: usize,
    },
    Set {
        tx: TxId,
        path: String,
        key: String,
        value: Value,
    },
    Remove {
        tx: TxId,
        path: String,
        key: String,
    },
    /// Text indices are in chars.
    Splice {
        tx: TxId,
        path: String,
        index: usize,
        delete: usize,
        insert: String,
    },
}

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Operation::Insert { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Set { path, .. }
            | Operation::Remove { path, .. }
            | Operation::Splice { path, .. } => path,
        }
    }

    pub fn tx(&self) -> TxId {
        match self {
            Operation::Insert { tx, .. }
            | Operation::Delete { tx, .. }
            | Operation::Set { tx, .. }
            | Operation::Remove { tx, .. }
            | Operation::Splice { tx, .. } => *tx,
        }
    }

    pub fn kind(&self) -> CollectionKind {
        match self {
            Operation::Insert { .. } | Operation::Delete { .. } => CollectionKind::Sequence,
            Operation::Set { .. } | Operation::Remove { .. } => CollectionKind::Map,
            Operation::Splice { .. } => CollectionKind::Text,
        }
    }
}

/// Plain working copy of one collection inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Shadow {
    Sequence(Vec<Value>),
    Map(Map<String, Value>),
    Text(Vec<char>),
}

impl Shadow {
    /// Build from a plain snapshot of the given kind.
    pub fn from_value(kind: CollectionKind, value: Value) -> Self {
        match (kind, value) {
            (CollectionKind::Sequence, Value::Array(items)) => Shadow::Sequence(items),
            (CollectionKind::Map, Value::Object(fields)) => Shadow::Map(fields),
            (CollectionKind::Text, Value::String(s)) => Shadow::Text(s.chars().collect()),
            (CollectionKind::Sequence, _) => Shadow::Sequence(Vec::new()),
            (CollectionKind::Map, _) => Shadow::Map(Map::new()),
            (CollectionKind::Text, _) => Shadow::Text(Vec::new()),
        }
    }

    pub fn kind(&self) -> CollectionKind {
        match self {
            Shadow::Sequence(_) => CollectionKind::Sequence,
            Shadow::Map(_) => CollectionKind::Map,
            Shadow::Text(_) => CollectionKind::Text,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Shadow::Sequence(items) => Value::Array(items.clone()),
            Shadow::Map(fields) => Value::Object(fields.clone()),
            Shadow::Text(chars) => Value::String(chars.iter().collect()),
        }
    }
}

/// Restore point for a nested transaction.
#[derive(Debug, Clone)]
pub struct Savepoint {
    ops: usize,
    shadows: HashMap<String, Shadow>,
}

/// Pending change set of one transaction.
///
/// Mutations are resolved against the shadows first, so stale indices clamp
/// to what the transaction currently sees and no-ops never reach the log.
#[derive(Debug)]
pub struct Staging {
    tx: TxId,
    shadows: HashMap<String, Shadow>,
    ops: Vec<Operation>,
}

impl Staging {
    pub fn new(tx: TxId) -> Self {
        Self {
            tx,
            shadows: HashMap::new(),
            ops: Vec::new(),
        }
    }

    pub fn tx(&self) -> TxId {
        self.tx
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Operation> {
        self.ops
    }

    pub fn has_shadow(&self, path: &str) -> bool {
        self.shadows.contains_key(path)
    }

    pub fn install(&mut self, path: &str, shadow: Shadow) {
        self.shadows.insert(path.to_string(), shadow);
    }

    pub fn shadow(&self, path: &str) -> Option<&Shadow> {
        self.shadows.get(path)
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            ops: self.ops.len(),
            shadows: self.shadows.clone(),
        }
    }

    pub fn rollback(&mut self, savepoint: Savepoint) {
        self.ops.truncate(savepoint.ops);
        self.shadows = savepoint.shadows;
    }

    /// Insert before `index`, clamped to the end. Returns the index used.
    pub fn insert(&mut self, path: &str, index: usize, values: Vec<Value>) -> Option<usize> {
        let Some(Shadow::Sequence(items)) = self.shadows.get_mut(path) else {
            return None;
        };
        if values.is_empty() {
            return None;
        }
        let index = index.min(items.len());
        items.splice(index..index, values.iter().cloned());
        self.ops.push(Operation::Insert {
            tx: self.tx,
            path: path.to_string(),
            index,
            values,
        });
        Some(index)
    }

    /// Delete up to `len` items from `index`. Returns how many were removed.
    pub fn delete(&mut self, path: &str, index: usize, len: usize) -> usize {
        let Some(Shadow::Sequence(items)) = self.shadows.get_mut(path) else {
            return 0;
        };
        if index >= items.len() || len == 0 {
            return 0;
        }
        let len = len.min(items.len() - index);
        items.drain(index..index + len);
        self.ops.push(Operation::Delete {
            tx: self.tx,
            path: path.to_string(),
            index,
            len,
        });
        len
    }

    pub fn set(&mut self, path: &str, key: &str, value: Value) -> bool {
        let Some(Shadow::Map(fields)) = self.shadows.get_mut(path) else {
            return false;
        };
        fields.insert(key.to_string(), value.clone());
        self.ops.push(Operation::Set {
            tx: self.tx,
            path: path.to_string(),
            key: key.to_string(),
            value,
        });
        true
    }

    /// Remove `key`; a missing key is a no-op.
    pub fn remove(&mut self, path: &str, key: &str) -> bool {
        let Some(Shadow::Map(fields)) = self.shadows.get_mut(path) else {
            return false;
        };
        if fields.remove(key).is_none() {
            return false;
        }
        self.ops.push(Operation::Remove {
            tx: self.tx,
            path: path.to_string(),
            key: key.to_string(),
        });
        true
    }

    /// Replace `delete` chars at `index` with `insert`, clamped to the text.
    pub fn splice(&mut self, path: &str, index: usize, delete: usize, insert: &str) -> bool {
        let Some(Shadow::Text(chars)) = self.shadows.get_mut(path) else {
            return false;
        };
        let index = index.min(chars.len());
        let delete = delete.min(chars.len() - index);
        if delete == 0 && insert.is_empty() {
            return false;
        }
        chars.splice(index..index + delete, insert.chars());
        self.ops.push(Operation::Splice {
            tx: self.tx,
            path: path.to_string(),
            index,
            delete,
            insert: insert.to_string(),
        });
        true
    }
}
