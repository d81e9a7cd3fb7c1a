//! Records stored in a notes room and the schema that declares them.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tessel_core::{FieldShape, Schema, SchemaError};

/// Sequence of all notes, newest last.
pub const NOTES: &str = "notes";
/// Prefix of each note's message sequence.
pub const MESSAGES_PREFIX: &str = "messages.";
/// Per-room settings.
pub const ROOMS: &str = "rooms";

pub const DEFAULT_TITLE: &str = "New Note";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    pub title: String,
}

impl Note {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now_millis(),
            title: DEFAULT_TITLE.to_string(),
        }
    }
}

impl Default for Note {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub data: String,
}

impl Message {
    pub fn new(data: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            data: data.to_string(),
        }
    }
}

pub fn messages_path(note_id: &str) -> String {
    format!("{MESSAGES_PREFIX}{note_id}")
}

pub fn schema() -> Result<Schema, SchemaError> {
    Schema::builder()
        .sequence(NOTES)
        .sequence_prefix(MESSAGES_PREFIX)
        .map_with_fields(ROOMS, [("roomName", FieldShape::String)])
        .strict(true)
        .build()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
