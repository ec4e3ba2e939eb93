//! Identity types for requests, resolvers, requesters and providers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Opaque, globally unique identifier.
///
/// Tokens name requests, resolvers, requesters and providers without holding
/// references to them. Every cross-entity relation in the request system is a
/// token plus a lookup through the manager's own maps.
///
/// Backed by UUIDv7, so tokens sort by creation time. The manager relies on
/// that to iterate its request index in a stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(Uuid);

impl Token {
    /// Generate a fresh token.
    pub fn new() -> Self {
        Token(Uuid::now_v7())
    }

    /// Wrap an existing UUID (used when loading persisted tokens).
    pub fn from_uuid(id: Uuid) -> Self {
        Token(id)
    }

    /// The nil token. Never issued by [`Token::new`].
    pub fn nil() -> Self {
        Token(Uuid::nil())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Token {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Token)
    }
}

impl From<Uuid> for Token {
    fn from(id: Uuid) -> Self {
        Token(id)
    }
}
