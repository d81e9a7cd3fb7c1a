//! Stable identifiers for rooms.
//!
//! A room is addressed by its human-readable name everywhere above the
//! storage layer. On disk it is addressed by a UUIDv5 of that name, so the
//! same name always maps to the same 16-byte key prefix and directory.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Deterministic storage key for a room name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomKey(Uuid);

impl RoomKey {
    /// Derive the key for a room name.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Directory name used for this room below the store root.
    pub fn dir_name(&self) -> String {
        format!("room-{}", self.0.simple())
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
