//! Error types for the document runtime.
//!
//! Three families, matching how callers are expected to react:
//! - [`Error`]: misuse of the API (wrong kind, closed document, ...). Fatal,
//!   never retried.
//! - [`DecodeError`]: the persisted log of a room cannot be reconstructed.
//! - [`SchemaError`]: a schema declaration is invalid; raised at construction.
//!
//! Durability failures are not errors here; they arrive as
//! [`StoreEvent`](crate::persist::StoreEvent)s.

use thiserror::Error;

use crate::schema::{CollectionKind, FieldShape};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("path `{path}` is a {existing} collection, requested as {requested}")]
    KindMismatch {
        path: String,
        existing: CollectionKind,
        requested: CollectionKind,
    },
    #[error("path `{0}` is not declared in the schema")]
    UndeclaredPath(String),
    #[error("field `{field}` is not declared for map `{path}`")]
    UndeclaredField { path: String, field: String },
    #[error("field `{field}` of map `{path}` must be {expected}")]
    FieldShape {
        path: String,
        field: String,
        expected: FieldShape,
    },
    #[error("path `{0}` is reserved")]
    ReservedPath(String),
    #[error("document `{0}` is closed")]
    Closed(String),
    #[error("document `{0}` has not finished its initial sync")]
    NotSynced(String),
    #[error("handle for `{0}` belongs to another document")]
    ForeignHandle(String),
    #[error("a transaction is already running on this thread")]
    ReentrantTransaction,
    #[error("observation of `{0}` is detached")]
    Detached(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Error {
    /// True for caller bugs; false for failures of persisted data.
    pub fn is_programming_error(&self) -> bool {
        !matches!(self, Error::Decode(_))
    }
}

/// A room's persisted log could not be replayed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("stored log is unreadable: {0}")]
    Storage(String),
    #[error("record {version} is malformed: {reason}")]
    Record { version: u64, reason: String },
    #[error("update {version} could not be decoded: {reason}")]
    Update { version: u64, reason: String },
    #[error("update {version} could not be applied: {reason}")]
    Apply { version: u64, reason: String },
    #[error("replay up to version {version} left updates referencing unknown items")]
    Incomplete { version: u64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("path `{0}` is declared more than once")]
    Duplicate(String),
    #[error("declaration with an empty path")]
    EmptyPath,
    #[error("unknown collection kind `{kind}` for `{path}`")]
    UnknownKind { path: String, kind: String },
    #[error("unknown shape `{shape}` for field `{field}` of `{path}`")]
    UnknownFieldShape {
        path: String,
        field: String,
        shape: String,
    },
    #[error("fields declared on `{0}`, which is not a map")]
    FieldsOnNonMap(String),
    #[error("invalid schema document: {0}")]
    Json(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert!(Error::ReentrantTransaction.is_programming_error());
        assert!(Error::Closed("inbox".into()).is_programming_error());
        assert!(!Error::Decode(DecodeError::Incomplete { version: 3 }).is_programming_error());
    }

    #[test]
    fn test_messages_name_the_path() {
        let err = Error::KindMismatch {
            path: "notes".into(),
            existing: CollectionKind::Sequence,
            requested: CollectionKind::Map,
        };
        assert_eq!(
            err.to_string(),
            "path `notes` is a sequence collection, requested as map"
        );
    }
}
