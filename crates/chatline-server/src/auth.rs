use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use chatline_core::ids::UserId;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing access token")]
    MissingToken,
    #[error("invalid access token")]
    InvalidToken,
}

/// What a client presented on the upgrade request.
#[derive(Clone, Copy, Debug, Default)]
pub struct Credentials<'a> {
    /// From `Authorization: Bearer <token>`.
    pub bearer: Option<&'a str>,
    /// From `?token=`, for clients that cannot set headers on a WebSocket.
    pub query_token: Option<&'a str>,
    /// From `?user_id=`.
    pub user_id: Option<&'a str>,
}

impl<'a> Credentials<'a> {
    /// The header token wins over the query token.
    pub fn token(&self) -> Option<&'a str> {
        self.bearer
            .or(self.query_token)
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn user(&self) -> Option<UserId> {
        self.user_id
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(UserId::from_raw)
    }
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Decides whether an upgrade request may become a registered connection,
/// and which user (if any) it is bound to.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials<'_>) -> Result<Option<UserId>, AuthError>;
}

/// Accepts everyone. Binds the connection to `?user_id=` when given.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAnonymous;

impl Authenticator for AllowAnonymous {
    fn authenticate(&self, credentials: &Credentials<'_>) -> Result<Option<UserId>, AuthError> {
        Ok(credentials.user())
    }
}

/// Requires every client to present one shared secret.
///
/// Only the SHA-256 digest of the secret is kept in memory.
pub struct SharedTokenAuthenticator {
    digest: [u8; 32],
}

impl SharedTokenAuthenticator {
    pub fn new(token: &SecretString) -> Self {
        Self {
            digest: digest(token.expose_secret()),
        }
    }
}

impl Authenticator for SharedTokenAuthenticator {
    fn authenticate(&self, credentials: &Credentials<'_>) -> Result<Option<UserId>, AuthError> {
        let token = credentials.token().ok_or(AuthError::MissingToken)?;
        if !constant_time_eq(&digest(token), &self.digest) {
            return Err(AuthError::InvalidToken);
        }
        Ok(credentials.user())
    }
}

fn digest(value: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
