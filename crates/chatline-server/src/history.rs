use std::sync::Arc;

use chatline_core::ids::{RoomId, UserId};
use chatline_core::{ConversationKey, DeliveryPayload, Message, Recipient};
use chatline_store::{MessageStore, StoreError};

/// Builds the payload broadcast after each persisted message: the whole
/// visible history it belongs to, not just the new message.
#[derive(Clone)]
pub struct HistoryAssembler {
    store: Arc<dyn MessageStore>,
}

impl HistoryAssembler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Full conversation between the pair, oldest first. Symmetric in its arguments.
    pub fn assemble(&self, sender: &UserId, receiver: &UserId) -> Result<DeliveryPayload, StoreError> {
        let messages = self.store.conversation(sender, receiver)?;
        let key = ConversationKey::new(sender.clone(), receiver.clone());
        Ok(DeliveryPayload::conversation(key, messages))
    }

    pub fn assemble_room(&self, room: &RoomId) -> Result<DeliveryPayload, StoreError> {
        let messages = self.store.room_messages(room)?;
        Ok(DeliveryPayload::room(room.clone(), messages))
    }

    /// History for whatever `message` was addressed to.
    pub fn assemble_for(&self, message: &Message) -> Result<DeliveryPayload, StoreError> {
        match &message.recipient {
            Recipient::User(receiver) => self.assemble(&message.sender_id, receiver),
            Recipient::Room(room) => self.assemble_room(room),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyStore;
    use chatline_core::{Audience, NewMessage};

    fn user(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    #[test]
    fn assemble_returns_full_pair_history() {
        let store = FlakyStore::new();
        store.create(&NewMessage::direct(user("u1"), user("u2"), "hi")).unwrap();
        store.create(&NewMessage::direct(user("u2"), user("u1"), "hello")).unwrap();
        store.create(&NewMessage::direct(user("u1"), user("u3"), "other")).unwrap();

        let assembler = HistoryAssembler::new(store);
        let payload = assembler.assemble(&user("u2"), &user("u1")).unwrap();

        let contents: Vec<_> = payload.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "hello"]);
        assert_eq!(
            payload.audience,
            Audience::Conversation(ConversationKey::new(user("u1"), user("u2")))
        );
    }

    #[test]
    fn assemble_for_routes_room_messages() {
        let store = FlakyStore::new();
        let lobby = RoomId::from_raw("lobby");
        store.create(&NewMessage::to_room(user("a"), lobby.clone(), "one")).unwrap();
        let latest = store.create(&NewMessage::to_room(user("b"), lobby.clone(), "two")).unwrap();

        let payload = HistoryAssembler::new(store).assemble_for(&latest).unwrap();
        assert_eq!(payload.audience, Audience::Room(lobby));
        assert_eq!(payload.len(), 2);
        assert_eq!(payload.messages[1].id, latest.id);
    }

    #[test]
    fn store_failure_propagates() {
        let store = FlakyStore::new();
        store.fail_queries(true);
        let result = HistoryAssembler::new(store).assemble(&user("a"), &user("b"));
        assert!(matches!(result, Err(StoreError::Database(_))));
    }
}
