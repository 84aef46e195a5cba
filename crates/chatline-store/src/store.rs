use serde::Serialize;

use chatline_core::ids::{RoomId, UserId};
use chatline_core::{Message, NewMessage};

use crate::error::StoreError;

/// Durable, append-only message persistence consumed by the real-time core.
///
/// Implementations serialize their own writes. Every query returns messages
/// ordered by creation time ascending.
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning its id and creation timestamp.
    fn create(&self, message: &NewMessage) -> Result<Message, StoreError>;

    /// All messages exchanged between `a` and `b`, in either direction.
    fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, StoreError>;

    /// All messages posted to a room.
    fn room_messages(&self, room: &RoomId) -> Result<Vec<Message>, StoreError>;

    fn health(&self) -> StoreHealth;
}

#[derive(Clone, Debug, Serialize)]
pub struct StoreHealth {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoreHealth {
    pub fn up(message_count: i64) -> Self {
        Self {
            status: "up",
            message_count: Some(message_count),
            error: None,
        }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self {
            status: "down",
            message_count: None,
            error: Some(error.into()),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == "up"
    }
}
