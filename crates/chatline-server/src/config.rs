use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chatline_core::{Audience, DeliveryPayload};

use crate::registry::Connection;

/// Which registered connections receive a delivery payload.
///
/// `All` sends every payload to every connection, whether or not it
/// belongs to a participant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryScope {
    #[default]
    All,
    /// Conversation payloads go to connections authenticated as one of the
    /// pair; room payloads go to connections authenticated as a user who
    /// has posted in that room.
    Participants,
}

impl DeliveryScope {
    pub fn admits(self, connection: &Connection, payload: &DeliveryPayload) -> bool {
        match self {
            Self::All => true,
            Self::Participants => {
                let Some(user) = connection.user() else {
                    return false;
                };
                match &payload.audience {
                    Audience::Conversation(key) => key.involves(user),
                    Audience::Room(_) => payload.authored_by(user),
                }
            }
        }
    }
}

impl FromStr for DeliveryScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "participants" => Ok(Self::Participants),
            other => Err(format!("unknown delivery scope: {other} (expected all|participants)")),
        }
    }
}

impl fmt::Display for DeliveryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Participants => "participants",
        })
    }
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Upper bound on a single outbound write before the connection is dropped.
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Connections that have not answered a ping for this long are reaped.
    pub client_timeout: Duration,
    pub reap_interval: Duration,
    pub delivery_scope: DeliveryScope,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 9091,
            write_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            reap_interval: Duration::from_secs(60),
            delivery_scope: DeliveryScope::All,
        }
    }
}
