//! Transaction context and its read-your-writes views.

use serde_json::{Map, Value};

use crate::engine::ops::{Shadow, Staging, TxId};
use crate::error::{Error, Result};
use crate::runtime::handle::{Collection, MapHandle, SequenceHandle, TextHandle};
use crate::runtime::{lock, Document};
use crate::schema::Schema;

/// Mutations staged by one call to [`Document::transact`].
///
/// Nothing is visible outside the transaction until the closure returns
/// `Ok`; then every staged operation commits together and each observer of
/// a touched path gets exactly one push.
pub struct Transaction<'d> {
    doc: &'d Document,
    staging: Staging,
}

impl<'d> Transaction<'d> {
    pub(crate) fn new(doc: &'d Document, tx: TxId) -> Self {
        Self {
            doc,
            staging: Staging::new(tx),
        }
    }

    pub(crate) fn into_staging(self) -> Staging {
        self.staging
    }

    pub fn id(&self) -> TxId {
        self.staging.tx()
    }

    /// Operations staged so far.
    pub fn op_count(&self) -> usize {
        self.staging.ops().len()
    }

    /// Run `f` as a nested unit. If it fails, only its own operations are
    /// rolled back; the outer transaction still commits once.
    pub fn nested<R, E, F>(&mut self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Transaction<'d>) -> Result<R, E>,
    {
        let savepoint = self.staging.savepoint();
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.staging.rollback(savepoint);
                Err(e)
            }
        }
    }

    pub fn sequence<'a>(&'a mut self, handle: &SequenceHandle) -> Result<SequenceView<'a>> {
        self.bind(handle.collection())?;
        Ok(SequenceView {
            staging: &mut self.staging,
            path: handle.path().to_string(),
        })
    }

    pub fn map<'a>(&'a mut self, handle: &MapHandle) -> Result<MapView<'a>> {
        self.bind(handle.collection())?;
        Ok(MapView {
            staging: &mut self.staging,
            schema: &self.doc.inner.schema,
            path: handle.path().to_string(),
        })
    }

    pub fn text<'a>(&'a mut self, handle: &TextHandle) -> Result<TextView<'a>> {
        self.bind(handle.collection())?;
        Ok(TextView {
            staging: &mut self.staging,
            path: handle.path().to_string(),
        })
    }

    /// Load the working copy of a collection on first use.
    fn bind(&mut self, collection: &Collection) -> Result<()> {
        if collection.doc_id() != self.doc.inner.id {
            return Err(Error::ForeignHandle(collection.path().to_string()));
        }
        if self.staging.has_shadow(collection.path()) {
            return Ok(());
        }
        let value = lock(&self.doc.inner.engine).snapshot(collection.path(), collection.kind())?;
        self.staging.install(
            collection.path(),
            Shadow::from_value(collection.kind(), value),
        );
        Ok(())
    }
}

/// Ordered sequence as seen inside a transaction.
pub struct SequenceView<'a> {
    staging: &'a mut Staging,
    path: String,
}

impl SequenceView<'_> {
    fn items(&self) -> &[Value] {
        match self.staging.shadow(&self.path) {
            Some(Shadow::Sequence(items)) => items,
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items().get(index).cloned()
    }

    pub fn value(&self) -> Vec<Value> {
        self.items().to_vec()
    }

    /// Insert before `index`; past the end appends. Returns the index used.
    pub fn insert(&mut self, index: usize, values: impl IntoIterator<Item = Value>) -> usize {
        let values: Vec<Value> = values.into_iter().collect();
        self.staging
            .insert(&self.path, index, values)
            .unwrap_or_else(|| index.min(self.len()))
    }

    pub fn push(&mut self, value: Value) {
        let end = self.len();
        self.staging.insert(&self.path, end, vec![value]);
    }

    /// Delete up to `len` items at `index`. Returns how many went away.
    pub fn delete_range(&mut self, index: usize, len: usize) -> usize {
        self.staging.delete(&self.path, index, len)
    }

    /// Swap the item at `index` for `value`. No-op past the end.
    pub fn replace(&mut self, index: usize, value: Value) -> bool {
        if index >= self.len() {
            return false;
        }
        self.staging.delete(&self.path, index, 1);
        self.staging.insert(&self.path, index, vec![value]);
        true
    }

    pub fn clear(&mut self) -> usize {
        let len = self.len();
        self.staging.delete(&self.path, 0, len)
    }
}

/// Key-value map as seen inside a transaction.
pub struct MapView<'a> {
    staging: &'a mut Staging,
    schema: &'a Schema,
    path: String,
}

impl MapView<'_> {
    fn fields(&self) -> Option<&Map<String, Value>> {
        match self.staging.shadow(&self.path) {
            Some(Shadow::Map(fields)) => Some(fields),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.fields().and_then(|f| f.get(key)).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields().is_some_and(|f| f.contains_key(key))
    }

    pub fn keys(&self) -> Vec<String> {
        self.fields()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.fields().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self) -> Map<String, Value> {
        self.fields().cloned().unwrap_or_default()
    }

    /// Fails if the map declares fields and `key`/`value` don't fit them.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.schema.check_field(&self.path, key, &value)?;
        self.staging.set(&self.path, key, value);
        Ok(())
    }

    /// Returns false when the key was not there.
    pub fn delete(&mut self, key: &str) -> bool {
        self.staging.remove(&self.path, key)
    }
}

/// Text as seen inside a transaction. Offsets count chars.
pub struct TextView<'a> {
    staging: &'a mut Staging,
    path: String,
}

impl TextView<'_> {
    fn chars(&self) -> &[char] {
        match self.staging.shadow(&self.path) {
            Some(Shadow::Text(chars)) => chars,
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.chars().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars().is_empty()
    }

    pub fn value(&self) -> String {
        self.chars().iter().collect()
    }

    pub fn splice(&mut self, index: usize, delete: usize, insert: &str) -> bool {
        self.staging.splice(&self.path, index, delete, insert)
    }

    pub fn insert(&mut self, index: usize, text: &str) -> bool {
        self.splice(index, 0, text)
    }

    pub fn push_str(&mut self, text: &str) -> bool {
        let end = self.len();
        self.splice(end, 0, text)
    }

    pub fn delete(&mut self, index: usize, len: usize) -> bool {
        self.splice(index, len, "")
    }
}
