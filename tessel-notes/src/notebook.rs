//! Notes and their message threads on top of a [`Document`].

use serde_json::Value;
use tessel_core::{Document, Error as CoreError, SchemaError, SequenceHandle};
use thiserror::Error;

use crate::model::{messages_path, Message, Note, NOTES, ROOMS};

#[derive(Debug, Error)]
pub enum NotesError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("record does not match the notes model: {0}")]
    Record(#[from] serde_json::Error),
    #[error("no note with id `{0}`")]
    UnknownNote(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

pub type Result<T, E = NotesError> = std::result::Result<T, E>;

/// Which note the user is looking at. Kept outside the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    note: Option<String>,
}

impl Selection {
    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.note.is_none()
    }

    fn set(&mut self, id: &str) {
        self.note = Some(id.to_string());
    }

    fn clear(&mut self) {
        self.note = None;
    }
}

pub struct Notebook {
    doc: Document,
    notes: SequenceHandle,
    selection: Selection,
}

impl Notebook {
    /// Wrap a synced document.
    pub fn new(doc: Document) -> Result<Self> {
        let notes = doc.sequence(NOTES)?;
        Ok(Self {
            doc,
            notes,
            selection: Selection::default(),
        })
    }

    /// Insert a "New Note" if the room has none, and record the room name.
    ///
    /// Meant to run from [`Document::on_initial_sync`], before any view sees
    /// the notes list. Returns whether a note was created.
    pub fn seed_if_empty(doc: &Document) -> Result<bool> {
        let notes = doc.sequence(NOTES)?;
        let rooms = doc.map(ROOMS)?;
        let room = doc.room().to_string();
        let seeded = doc.transact(|tx| {
            let mut meta = tx.map(&rooms)?;
            if !meta.contains_key("roomName") {
                meta.set("roomName", Value::String(room))?;
            }
            let mut list = tx.sequence(&notes)?;
            if !list.is_empty() {
                return Ok::<_, NotesError>(false);
            }
            list.push(serde_json::to_value(Note::new())?);
            Ok(true)
        })?;
        if seeded {
            log::info!("room `{}`: seeded first note", doc.room());
        }
        Ok(seeded)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn room_name(&self) -> Result<Option<String>> {
        let rooms = self.doc.map(ROOMS)?;
        Ok(rooms
            .get("roomName")?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// All notes, in list order. Entries that are not notes are skipped.
    pub fn notes(&self) -> Result<Vec<Note>> {
        Ok(self
            .notes
            .snapshot()?
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(note) => Some(note),
                Err(e) => {
                    log::warn!("skipping malformed note: {e}");
                    None
                }
            })
            .collect())
    }

    pub fn note(&self, id: &str) -> Result<Note> {
        self.notes()?
            .into_iter()
            .find(|note| note.id == id)
            .ok_or_else(|| NotesError::UnknownNote(id.to_string()))
    }

    /// Messages of an existing note, oldest first.
    pub fn messages(&self, note_id: &str) -> Result<Vec<Message>> {
        self.note(note_id)?;
        let messages = self.doc.sequence(&messages_path(note_id))?;
        messages
            .snapshot()?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(NotesError::from))
            .collect()
    }

    /// Append a fresh note and select it.
    pub fn create_note(&mut self) -> Result<Note> {
        let note = Note::new();
        self.notes.push(serde_json::to_value(&note)?)?;
        self.selection.set(&note.id);
        Ok(note)
    }

    /// Delete every note. The selection goes with them.
    pub fn clear_notes(&mut self) -> Result<usize> {
        let removed = self
            .doc
            .transact(|tx| Ok::<_, CoreError>(tx.sequence(&self.notes)?.clear()))?;
        self.selection.clear();
        Ok(removed)
    }

    /// Append a message to a note's thread.
    ///
    /// The first message of a thread also becomes the note's title, in the
    /// same transaction; later messages leave the title alone.
    pub fn send_message(&self, note_id: &str, text: &str) -> Result<Message> {
        self.note(note_id)?;
        let thread = self.doc.sequence(&messages_path(note_id))?;
        let message = Message::new(text);
        let record = serde_json::to_value(&message)?;

        self.doc.transact(|tx| {
            let index = {
                let notes = tx.sequence(&self.notes)?;
                (0..notes.len())
                    .find(|&i| notes.get(i).is_some_and(|n| n["id"] == note_id))
                    .ok_or_else(|| NotesError::UnknownNote(note_id.to_string()))?
            };

            let mut messages = tx.sequence(&thread)?;
            let first = messages.is_empty();
            messages.push(record);

            if first {
                let mut notes = tx.sequence(&self.notes)?;
                if let Some(mut note) = notes.get(index) {
                    note["title"] = Value::String(text.to_string());
                    notes.replace(index, note);
                }
            }
            Ok::<_, NotesError>(())
        })?;

        log::debug!("message {} sent to note {note_id}", message.id);
        Ok(message)
    }

    /// Select `id`. Fails if no such note exists.
    pub fn select(&mut self, id: &str) -> Result<()> {
        self.note(id)?;
        self.selection.set(id);
        Ok(())
    }

    /// The current selection, dropped if its note is gone.
    pub fn selection(&mut self) -> Result<&Selection> {
        if let Some(id) = self.selection.note() {
            let id = id.to_string();
            if self.note(&id).is_err() {
                self.selection.clear();
            }
        }
        Ok(&self.selection)
    }
}
