/// Reasons an inbound frame cannot become a storable message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message has no sender")]
    MissingSender,
    #[error("message needs a receiver_id or a chatroom_id")]
    MissingRecipient,
    #[error("message cannot have both a receiver_id and a chatroom_id")]
    AmbiguousRecipient,
}

impl ValidationError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingSender => "missing_sender",
            Self::MissingRecipient => "missing_recipient",
            Self::AmbiguousRecipient => "ambiguous_recipient",
        }
    }
}
