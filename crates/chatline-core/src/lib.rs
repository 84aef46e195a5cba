pub mod errors;
pub mod ids;
pub mod messages;

pub use errors::ValidationError;
pub use messages::{
    Audience, ConversationKey, DeliveryPayload, InboundMessage, Message, NewMessage, Recipient,
};
