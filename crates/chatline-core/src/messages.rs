use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::ids::{MessageId, RoomId, UserId};

/// Where a message is addressed: one user, or one chat room. Never both.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Recipient {
    User(UserId),
    Room(RoomId),
}

/// Chat message frame as a client sends it over the persistent channel.
///
/// Empty strings are treated the same as absent fields, so
/// `{"receiver_id": "", "chatroom_id": "lobby"}` addresses the room.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chatroom_id: Option<String>,
    #[serde(default)]
    pub content: String,
}

impl InboundMessage {
    pub fn direct(sender: &str, receiver: &str, content: &str) -> Self {
        Self {
            sender_id: sender.into(),
            receiver_id: Some(receiver.into()),
            chatroom_id: None,
            content: content.into(),
        }
    }

    pub fn to_room(sender: &str, room: &str, content: &str) -> Self {
        Self {
            sender_id: sender.into(),
            receiver_id: None,
            chatroom_id: Some(room.into()),
            content: content.into(),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// A validated message that has not been persisted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient: Recipient,
    pub content: String,
}

impl NewMessage {
    pub fn direct(sender: UserId, receiver: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender,
            recipient: Recipient::User(receiver),
            content: content.into(),
        }
    }

    pub fn to_room(sender: UserId, room: RoomId, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender,
            recipient: Recipient::Room(room),
            content: content.into(),
        }
    }
}

impl TryFrom<InboundMessage> for NewMessage {
    type Error = ValidationError;

    fn try_from(raw: InboundMessage) -> Result<Self, Self::Error> {
        if raw.sender_id.trim().is_empty() {
            return Err(ValidationError::MissingSender);
        }
        let recipient = match (non_blank(raw.receiver_id), non_blank(raw.chatroom_id)) {
            (Some(receiver), None) => Recipient::User(UserId::from_raw(receiver)),
            (None, Some(room)) => Recipient::Room(RoomId::from_raw(room)),
            (Some(_), Some(_)) => return Err(ValidationError::AmbiguousRecipient),
            (None, None) => return Err(ValidationError::MissingRecipient),
        };
        Ok(Self {
            sender_id: UserId::from_raw(raw.sender_id),
            recipient,
            content: raw.content,
        })
    }
}

/// A persisted message. Immutable once the store has assigned its id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient: Recipient,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn receiver_id(&self) -> Option<&UserId> {
        match &self.recipient {
            Recipient::User(user) => Some(user),
            Recipient::Room(_) => None,
        }
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        match &self.recipient {
            Recipient::Room(room) => Some(room),
            Recipient::User(_) => None,
        }
    }

    /// Who should see the history this message belongs to.
    pub fn audience(&self) -> Audience {
        match &self.recipient {
            Recipient::User(receiver) => {
                Audience::Conversation(ConversationKey::new(self.sender_id.clone(), receiver.clone()))
            }
            Recipient::Room(room) => Audience::Room(room.clone()),
        }
    }
}

/// Flat JSON shape used on the wire and in logs.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct WireMessage {
    id: MessageId,
    sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chatroom_id: Option<RoomId>,
    content: String,
    created_at: DateTime<Utc>,
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        let (receiver_id, chatroom_id) = match msg.recipient {
            Recipient::User(user) => (Some(user), None),
            Recipient::Room(room) => (None, Some(room)),
        };
        Self {
            id: msg.id,
            sender_id: msg.sender_id,
            receiver_id,
            chatroom_id,
            content: msg.content,
            created_at: msg.created_at,
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = ValidationError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let recipient = match (wire.receiver_id, wire.chatroom_id) {
            (Some(user), None) => Recipient::User(user),
            (None, Some(room)) => Recipient::Room(room),
            (Some(_), Some(_)) => return Err(ValidationError::AmbiguousRecipient),
            (None, None) => return Err(ValidationError::MissingRecipient),
        };
        Ok(Self {
            id: wire.id,
            sender_id: wire.sender_id,
            recipient,
            content: wire.content,
            created_at: wire.created_at,
        })
    }
}

/// Unordered pair of users identifying a one-to-one conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }
}

/// Who a delivery payload concerns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Audience {
    Conversation(ConversationKey),
    Room(RoomId),
}

/// Ordered history handed from the assembler to the dispatcher.
#[derive(Clone, Debug)]
pub struct DeliveryPayload {
    pub audience: Audience,
    pub messages: Vec<Message>,
}

impl DeliveryPayload {
    pub fn conversation(key: ConversationKey, messages: Vec<Message>) -> Self {
        Self {
            audience: Audience::Conversation(key),
            messages,
        }
    }

    pub fn room(room: RoomId, messages: Vec<Message>) -> Self {
        Self {
            audience: Audience::Room(room),
            messages,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True if `user` wrote any message in this payload.
    pub fn authored_by(&self, user: &UserId) -> bool {
        self.messages.iter().any(|m| &m.sender_id == user)
    }

    /// Body written to every receiving connection: the bare JSON array of messages.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.messages)
    }
}
