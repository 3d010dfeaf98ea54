//! The wire-level event envelope.
//!
//! Every broker message body is UTF-8 JSON of the form
//! `{ "event_type": <string>, "data": <object> }`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Event kinds the relay forwards to the gateway.
pub mod kinds {
    pub const TEAM_CREATED: &str = "team_created";
    pub const PLAYER_CREATED: &str = "player_created";
    pub const TEAM_JOINED: &str = "team_joined";
}

/// A domain event: its kind plus a kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Open string enum, e.g. `team_created`.
    #[serde(rename = "event_type")]
    pub kind: String,

    /// Untyped key/value data whose shape depends on `kind`.
    #[serde(rename = "data", default)]
    pub payload: Map<String, Value>,
}

/// A message body that is not a valid envelope.
#[derive(Error, Debug)]
#[error("malformed envelope: {source}")]
pub struct DecodeError {
    /// The raw body, lossily decoded for logging.
    pub raw: String,
    #[source]
    pub source: serde_json::Error,
}

impl EventEnvelope {
    /// Create an envelope from a kind and payload.
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Decode a broker message body.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(body).map_err(|source| DecodeError {
            raw: String::from_utf8_lossy(body).into_owned(),
            source,
        })
    }

    /// Encode as a broker message body.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
