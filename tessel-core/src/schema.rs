//! Declarative description of which paths exist and what they hold.
//!
//! A [`Schema`] maps paths (or path prefixes) to a [`CollectionKind`] and, for
//! maps, optional field shapes. It is validated once when built and is pure
//! metadata afterwards.
//!
//! ```
//! use tessel_core::{CollectionKind, FieldShape, Schema};
//!
//! let schema = Schema::builder()
//!     .sequence("notes")
//!     .sequence_prefix("messages.")
//!     .map_with_fields("rooms", [("roomName", FieldShape::String)])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(schema.kind_of("messages.n1"), Some(CollectionKind::Sequence));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result, SchemaError};

/// The three replicated collection kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Sequence,
    Map,
    Text,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Sequence => "sequence",
            CollectionKind::Map => "map",
            CollectionKind::Text => "text",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sequence" => Ok(CollectionKind::Sequence),
            "map" => Ok(CollectionKind::Map),
            "text" => Ok(CollectionKind::Text),
            other => Err(other.to_string()),
        }
    }
}

/// Expected shape of a map field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldShape {
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldShape {
    /// Whether `value` has this shape. `null` only matches `Any`.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldShape::String => value.is_string(),
            FieldShape::Number => value.is_number(),
            FieldShape::Integer => value.is_i64() || value.is_u64(),
            FieldShape::Bool => value.is_boolean(),
            FieldShape::Object => value.is_object(),
            FieldShape::Array => value.is_array(),
            FieldShape::Any => true,
        }
    }
}

impl fmt::Display for FieldShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldShape::String => "string",
            FieldShape::Number => "number",
            FieldShape::Integer => "integer",
            FieldShape::Bool => "bool",
            FieldShape::Object => "object",
            FieldShape::Array => "array",
            FieldShape::Any => "any",
        };
        f.write_str(name)
    }
}

impl FromStr for FieldShape {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "string" => Ok(FieldShape::String),
            "number" => Ok(FieldShape::Number),
            "integer" => Ok(FieldShape::Integer),
            "bool" | "boolean" => Ok(FieldShape::Bool),
            "object" => Ok(FieldShape::Object),
            "array" => Ok(FieldShape::Array),
            "any" => Ok(FieldShape::Any),
            other => Err(other.to_string()),
        }
    }
}

/// One declared path.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub kind: CollectionKind,
    /// Declared map fields; `None` leaves the map open.
    pub fields: Option<BTreeMap<String, FieldShape>>,
}

/// Validated path registry.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    exact: HashMap<String, Declaration>,
    /// Sorted longest first.
    prefixes: Vec<(String, Declaration)>,
    strict: bool,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// A schema that declares nothing and allows every path.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Parse the declarative form.
    ///
    /// Either a list of declarations or `{"strict": bool, "collections": [...]}`.
    /// Each declaration is `{"path", "kind", "fields"?}`; a path ending in `*`
    /// declares a prefix.
    pub fn from_json(source: &str) -> Result<Self, SchemaError> {
        #[derive(Deserialize)]
        struct RawDeclaration {
            path: String,
            kind: String,
            #[serde(default)]
            fields: Option<BTreeMap<String, String>>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawSchema {
            List(Vec<RawDeclaration>),
            Document {
                #[serde(default)]
                strict: bool,
                collections: Vec<RawDeclaration>,
            },
        }

        let raw: RawSchema =
            serde_json::from_str(source).map_err(|e| SchemaError::Json(e.to_string()))?;
        let (strict, declarations) = match raw {
            RawSchema::List(list) => (false, list),
            RawSchema::Document {
                strict,
                collections,
            } => (strict, collections),
        };

        let mut builder = Schema::builder().strict(strict);
        for decl in declarations {
            let kind = CollectionKind::from_str(&decl.kind).map_err(|kind| {
                SchemaError::UnknownKind {
                    path: decl.path.clone(),
                    kind,
                }
            })?;
            let fields = match decl.fields {
                Some(raw) => {
                    let mut fields = BTreeMap::new();
                    for (field, shape) in raw {
                        let shape = FieldShape::from_str(&shape).map_err(|shape| {
                            SchemaError::UnknownFieldShape {
                                path: decl.path.clone(),
                                field: field.clone(),
                                shape,
                            }
                        })?;
                        fields.insert(field, shape);
                    }
                    Some(fields)
                }
                None => None,
            };
            builder = match decl.path.strip_suffix('*') {
                Some(prefix) => builder.declare(prefix, true, kind, fields),
                None => builder.declare(&decl.path, false, kind, fields),
            };
        }
        builder.build()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Declaration governing `path`: exact match first, then longest prefix.
    pub fn resolve(&self, path: &str) -> Option<&Declaration> {
        self.exact.get(path).or_else(|| {
            self.prefixes
                .iter()
                .find(|(prefix, _)| path.starts_with(prefix.as_str()))
                .map(|(_, decl)| decl)
        })
    }

    pub fn kind_of(&self, path: &str) -> Option<CollectionKind> {
        self.resolve(path).map(|d| d.kind)
    }

    /// Check that `path` may be used as `kind`.
    pub fn check(&self, path: &str, kind: CollectionKind) -> Result<()> {
        match self.resolve(path) {
            Some(decl) if decl.kind != kind => Err(Error::KindMismatch {
                path: path.to_string(),
                existing: decl.kind,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None if self.strict => Err(Error::UndeclaredPath(path.to_string())),
            None => Ok(()),
        }
    }

    /// Check a map write against declared fields.
    pub fn check_field(&self, path: &str, field: &str, value: &Value) -> Result<()> {
        let Some(fields) = self.resolve(path).and_then(|d| d.fields.as_ref()) else {
            return Ok(());
        };
        match fields.get(field) {
            Some(shape) if shape.matches(value) => Ok(()),
            Some(shape) => Err(Error::FieldShape {
                path: path.to_string(),
                field: field.to_string(),
                expected: *shape,
            }),
            None => Err(Error::UndeclaredField {
                path: path.to_string(),
                field: field.to_string(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects declarations; the first invalid one fails [`SchemaBuilder::build`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    exact: HashMap<String, Declaration>,
    prefixes: Vec<(String, Declaration)>,
    strict: bool,
    error: Option<SchemaError>,
}

impl SchemaBuilder {
    pub fn sequence(self, path: &str) -> Self {
        self.declare(path, false, CollectionKind::Sequence, None)
    }

    pub fn map(self, path: &str) -> Self {
        self.declare(path, false, CollectionKind::Map, None)
    }

    pub fn map_with_fields<I, K>(self, path: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldShape)>,
        K: Into<String>,
    {
        let fields = fields.into_iter().map(|(k, s)| (k.into(), s)).collect();
        self.declare(path, false, CollectionKind::Map, Some(fields))
    }

    pub fn text(self, path: &str) -> Self {
        self.declare(path, false, CollectionKind::Text, None)
    }

    pub fn sequence_prefix(self, prefix: &str) -> Self {
        self.declare(prefix, true, CollectionKind::Sequence, None)
    }

    pub fn map_prefix(self, prefix: &str) -> Self {
        self.declare(prefix, true, CollectionKind::Map, None)
    }

    pub fn text_prefix(self, prefix: &str) -> Self {
        self.declare(prefix, true, CollectionKind::Text, None)
    }

    /// Reject paths that are not declared.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn declare(
        mut self,
        path: &str,
        prefix: bool,
        kind: CollectionKind,
        fields: Option<BTreeMap<String, FieldShape>>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        if path.is_empty() {
            self.error = Some(SchemaError::EmptyPath);
            return self;
        }
        if fields.is_some() && kind != CollectionKind::Map {
            self.error = Some(SchemaError::FieldsOnNonMap(path.to_string()));
            return self;
        }

        let decl = Declaration { kind, fields };
        if prefix {
            if self.prefixes.iter().any(|(p, _)| p == path) {
                self.error = Some(SchemaError::Duplicate(format!("{path}*")));
                return self;
            }
            self.prefixes.push((path.to_string(), decl));
        } else {
            if self.exact.contains_key(path) {
                self.error = Some(SchemaError::Duplicate(path.to_string()));
                return self;
            }
            self.exact.insert(path.to_string(), decl);
        }
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let mut prefixes = self.prefixes;
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(Schema {
            exact: self.exact,
            prefixes,
            strict: self.strict,
        })
    }
}
