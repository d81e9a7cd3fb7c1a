//! Typed collection handles.
//!
//! A handle names one materialized collection of one document. Asking a
//! document for the same path twice yields the same underlying collection,
//! so handles compare equal by identity. Each mutator on a handle is a
//! single-operation transaction; batch several with [`Document::transact`].

use serde_json::{Map, Value};
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::runtime::{Document, Inner};
use crate::schema::CollectionKind;

/// A materialized collection, shared by every handle to its path.
#[derive(Debug)]
pub(crate) struct Collection {
    doc: Weak<Inner>,
    doc_id: u64,
    path: String,
    kind: CollectionKind,
}

impl Collection {
    pub(crate) fn new(doc: Weak<Inner>, doc_id: u64, path: &str, kind: CollectionKind) -> Self {
        Self {
            doc,
            doc_id,
            path: path.to_string(),
            kind,
        }
    }

    pub(crate) fn doc_id(&self) -> u64 {
        self.doc_id
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// The owning document, if it is still open.
    fn document(&self) -> Result<Document> {
        let inner = self
            .doc
            .upgrade()
            .ok_or_else(|| Error::Closed(self.path.clone()))?;
        let doc = Document::from_inner(inner);
        doc.ensure_open()?;
        Ok(doc)
    }

    fn snapshot(&self) -> Result<Value> {
        self.document()?.snapshot_path(&self.path, self.kind)
    }
}

macro_rules! handle_identity {
    ($name:ident) => {
        impl $name {
            pub(crate) fn collection(&self) -> &Collection {
                &self.0
            }

            pub fn path(&self) -> &str {
                self.0.path()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }
        }

        impl Eq for $name {}
    };
}

/// Handle to an ordered sequence.
#[derive(Debug, Clone)]
pub struct SequenceHandle(pub(crate) Arc<Collection>);

/// Handle to a key-value map.
#[derive(Debug, Clone)]
pub struct MapHandle(pub(crate) Arc<Collection>);

/// Handle to a text.
#[derive(Debug, Clone)]
pub struct TextHandle(pub(crate) Arc<Collection>);

handle_identity!(SequenceHandle);
handle_identity!(MapHandle);
handle_identity!(TextHandle);

impl SequenceHandle {
    pub fn snapshot(&self) -> Result<Vec<Value>> {
        match self.0.snapshot()? {
            Value::Array(items) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Option<Value>> {
        Ok(self.snapshot()?.into_iter().nth(index))
    }

    pub fn insert(&self, index: usize, values: Vec<Value>) -> Result<usize> {
        self.0
            .document()?
            .transact(|tx| Ok(tx.sequence(self)?.insert(index, values)))
    }

    pub fn push(&self, value: Value) -> Result<()> {
        self.0
            .document()?
            .transact(|tx| Ok(tx.sequence(self)?.push(value)))
    }

    pub fn delete_range(&self, index: usize, len: usize) -> Result<usize> {
        self.0
            .document()?
            .transact(|tx| Ok(tx.sequence(self)?.delete_range(index, len)))
    }
}

impl MapHandle {
    pub fn snapshot(&self) -> Result<Map<String, Value>> {
        match self.0.snapshot()? {
            Value::Object(fields) => Ok(fields),
            _ => Ok(Map::new()),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.snapshot()?.remove(key))
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.0
            .document()?
            .transact(|tx| tx.map(self)?.set(key, value))
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.0
            .document()?
            .transact(|tx| Ok(tx.map(self)?.delete(key)))
    }
}

impl TextHandle {
    pub fn snapshot(&self) -> Result<String> {
        match self.0.snapshot()? {
            Value::String(text) => Ok(text),
            _ => Ok(String::new()),
        }
    }

    pub fn splice(&self, index: usize, delete: usize, insert: &str) -> Result<bool> {
        self.0
            .document()?
            .transact(|tx| Ok(tx.text(self)?.splice(index, delete, insert)))
    }

    pub fn insert(&self, index: usize, text: &str) -> Result<bool> {
        self.splice(index, 0, text)
    }

    pub fn push_str(&self, text: &str) -> Result<bool> {
        self.0
            .document()?
            .transact(|tx| Ok(tx.text(self)?.push_str(text)))
    }

    pub fn delete(&self, index: usize, len: usize) -> Result<bool> {
        self.splice(index, len, "")
    }
}

/// A handle of any kind, as returned by [`Document::collection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionHandle {
    Sequence(SequenceHandle),
    Map(MapHandle),
    Text(TextHandle),
}

impl CollectionHandle {
    pub(crate) fn from_collection(collection: Arc<Collection>) -> Self {
        match collection.kind() {
            CollectionKind::Sequence => CollectionHandle::Sequence(SequenceHandle(collection)),
            CollectionKind::Map => CollectionHandle::Map(MapHandle(collection)),
            CollectionKind::Text => CollectionHandle::Text(TextHandle(collection)),
        }
    }

    fn collection(&self) -> &Collection {
        match self {
            CollectionHandle::Sequence(h) => h.collection(),
            CollectionHandle::Map(h) => h.collection(),
            CollectionHandle::Text(h) => h.collection(),
        }
    }

    pub fn path(&self) -> &str {
        self.collection().path()
    }

    pub fn kind(&self) -> CollectionKind {
        self.collection().kind()
    }

    /// Plain deep copy of the collection.
    pub fn snapshot(&self) -> Result<Value> {
        self.collection().snapshot()
    }

    pub fn as_sequence(&self) -> Option<&SequenceHandle> {
        match self {
            CollectionHandle::Sequence(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapHandle> {
        match self {
            CollectionHandle::Map(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextHandle> {
        match self {
            CollectionHandle::Text(h) => Some(h),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::tests::synced;
    use crate::{CollectionKind, Error, Schema};
    use serde_json::json;

    #[test]
    fn test_same_path_same_collection() {
        let doc = synced(Schema::permissive());
        let a = doc.sequence("notes").unwrap();
        let b = doc.sequence("notes").unwrap();
        assert_eq!(a, b);
        let any = doc.collection("notes", CollectionKind::Sequence).unwrap();
        assert_eq!(any.as_sequence(), Some(&a));
        assert!(any.as_map().is_none());
    }

    #[test]
    fn test_auto_commit_mutators() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        assert_eq!(notes.insert(5, vec![json!(1), json!(2)]).unwrap(), 0);
        notes.push(json!(3)).unwrap();
        assert_eq!(notes.delete_range(0, 1).unwrap(), 1);
        assert_eq!(notes.delete_range(7, 1).unwrap(), 0);
        assert_eq!(notes.snapshot().unwrap(), vec![json!(2), json!(3)]);
        assert_eq!(notes.get(1).unwrap(), Some(json!(3)));

        let rooms = doc.map("rooms").unwrap();
        rooms.set("roomName", json!("hello")).unwrap();
        assert!(rooms.delete("roomName").unwrap());
        assert!(!rooms.delete("roomName").unwrap());

        let title = doc.text("title").unwrap();
        title.push_str("wrld").unwrap();
        title.insert(1, "o").unwrap();
        assert_eq!(title.snapshot().unwrap(), "world");

        // No-op calls commit nothing
        assert_eq!(doc.version(), 7);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        notes.push(json!({"id": "n1"})).unwrap();
        let mut copy = notes.snapshot().unwrap();
        copy[0]["id"] = json!("changed");
        assert_eq!(notes.snapshot().unwrap()[0]["id"], json!("n1"));
    }

    #[test]
    fn test_insert_then_delete_at_every_index() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        notes
            .insert(0, vec![json!({"id": "a"}), json!("b"), json!(3)])
            .unwrap();
        let before = notes.snapshot().unwrap();

        for i in 0..=before.len() {
            assert_eq!(notes.insert(i, vec![json!("x")]).unwrap(), i);
            assert_eq!(notes.get(i).unwrap(), Some(json!("x")));
            assert_eq!(notes.delete_range(i, 1).unwrap(), 1);
            assert_eq!(notes.snapshot().unwrap(), before, "index {i}");
        }
        assert_eq!(doc.version(), 1 + 2 * (before.len() as u64 + 1));
    }

    #[test]
    fn test_handle_after_close() {
        let doc = synced(Schema::permissive());
        let notes = doc.sequence("notes").unwrap();
        doc.close();
        assert!(matches!(notes.push(json!(1)), Err(Error::Closed(_))));
        assert!(matches!(notes.snapshot(), Err(Error::Closed(_))));
    }
}
