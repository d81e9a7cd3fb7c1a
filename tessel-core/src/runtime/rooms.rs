//! One active document per room.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::runtime::{lock, Document, DocumentConfig};
use crate::schema::Schema;

/// Opens documents on demand and keeps at most one open per room.
pub struct RoomRegistry {
    schema: Arc<Schema>,
    config: DocumentConfig,
    rooms: Mutex<HashMap<String, Document>>,
}

impl RoomRegistry {
    pub fn new(schema: Schema, config: DocumentConfig) -> Self {
        Self {
            schema: Arc::new(schema),
            config,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// The open document for `room`, opening it if needed.
    pub fn open(&self, room: &str) -> Document {
        let mut rooms = lock(&self.rooms);
        if let Some(doc) = rooms.get(room) {
            if !doc.is_closed() {
                return doc.clone();
            }
        }
        let doc = Document::open(room, self.schema.clone(), self.config.clone());
        rooms.insert(room.to_string(), doc.clone());
        doc
    }

    pub fn get(&self, room: &str) -> Option<Document> {
        lock(&self.rooms)
            .get(room)
            .filter(|doc| !doc.is_closed())
            .cloned()
    }

    /// Close and forget `room`. Returns false if it was not open.
    pub fn close(&self, room: &str) -> bool {
        let doc = lock(&self.rooms).remove(room);
        match doc {
            Some(doc) => {
                doc.close();
                true
            }
            None => false,
        }
    }

    /// Wipe `room`, close it and open it again empty.
    ///
    /// Observations and handles of the old document are invalidated.
    pub async fn reset(&self, room: &str) -> Result<Document> {
        let doc = self.open(room);
        doc.ready().await?;
        doc.wipe()?;
        self.close(room);
        let fresh = self.open(room);
        fresh.ready().await?;
        log::info!("room `{room}` reset");
        Ok(fresh)
    }

    pub fn close_all(&self) {
        let rooms: Vec<Document> = lock(&self.rooms).drain().map(|(_, doc)| doc).collect();
        for doc in rooms {
            doc.close();
        }
    }

    /// Names of the open rooms, sorted.
    pub fn rooms(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.rooms)
            .iter()
            .filter(|(_, doc)| !doc.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Drop for RoomRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Schema::permissive(), DocumentConfig::volatile())
    }

    #[test]
    fn test_one_document_per_room() {
        let rooms = registry();
        let a = rooms.open("hello");
        let b = rooms.open("hello");
        a.sequence("notes").unwrap().push(json!(1)).unwrap();
        assert_eq!(b.sequence("notes").unwrap().len().unwrap(), 1);
        assert_eq!(rooms.rooms(), vec!["hello".to_string()]);
        assert!(rooms.get("other").is_none());
    }

    #[test]
    fn test_close_and_reopen() {
        let rooms = registry();
        let first = rooms.open("hello");
        assert!(rooms.close("hello"));
        assert!(!rooms.close("hello"));
        assert!(first.is_closed());
        let second = rooms.open("hello");
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_reset_empties_room() {
        let rooms = registry();
        let doc = rooms.open("hello");
        doc.sequence("notes").unwrap().push(json!(1)).unwrap();

        let fresh = rooms.reset("hello").await.unwrap();
        assert!(doc.is_closed());
        assert!(fresh.sequence("notes").unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_close_all() {
        let rooms = registry();
        let a = rooms.open("a");
        let b = rooms.open("b");
        rooms.close_all();
        assert!(a.is_closed() && b.is_closed());
        assert!(rooms.rooms().is_empty());
    }
}
