//! Collaborative notes: a list of notes, each with a thread of messages,
//! kept in one room of a tessel document.

pub mod model;
pub mod notebook;

pub use model::{messages_path, schema, Message, Note};
pub use notebook::{Notebook, NotesError, Result, Selection};

use std::path::PathBuf;
use std::sync::Arc;
use tessel_core::{Document, DocumentConfig, StoreConfig};

/// Open `room` under `data_dir`, seeding it on first sync, and wait for it.
pub async fn open_notebook(data_dir: impl Into<PathBuf>, room: &str) -> Result<Notebook> {
    let config = DocumentConfig {
        store: Some(StoreConfig {
            path: data_dir.into(),
            ..StoreConfig::default()
        }),
        ..DocumentConfig::default()
    };
    open_with(room, config).await
}

pub async fn open_with(room: &str, config: DocumentConfig) -> Result<Notebook> {
    let doc = Document::open(room, Arc::new(schema()?), config);
    doc.on_initial_sync(|doc| {
        if let Err(e) = Notebook::seed_if_empty(doc) {
            log::error!("room `{}`: could not seed notes: {e}", doc.room());
        }
    });
    doc.ready().await?;
    Notebook::new(doc)
}
