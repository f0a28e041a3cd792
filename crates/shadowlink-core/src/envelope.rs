//! Command and response envelopes.
//!
//! A remote caller publishes a [`CommandEnvelope`] on
//! `{namespace}/{device_id}/commands/{action}` and waits for exactly one
//! [`ResponseEnvelope`] on `{namespace}/{device_id}/responses/{request_id}`.
//! The `request_id` is an opaque correlation token and is echoed verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Field name -> value mapping used for parameters and device state.
pub type StateMap = serde_json::Map<String, Value>;

/// Inbound command as published by the remote caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Caller-supplied correlation token
    #[serde(default = "generate_request_id")]
    pub request_id: String,
    /// Optional ISO-8601 timestamp set by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Action-specific parameters
    #[serde(default, deserialize_with = "null_as_empty")]
    pub parameters: StateMap,
}

fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<StateMap, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StateMap>::deserialize(deserializer)?.unwrap_or_default())
}

impl CommandEnvelope {
    /// Create an envelope with no parameters.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: None,
            parameters: StateMap::new(),
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Decode an envelope from a raw payload.
    ///
    /// A payload that is valid JSON but carries no `request_id` gets a fresh
    /// one so that the response can still be published on its own topic.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    /// Encode the envelope as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Best-effort extraction of `request_id` from a payload that failed to decode.
///
/// Returns an empty string when nothing usable can be found.
pub fn salvage_request_id(payload: &[u8]) -> String {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|value| {
            value
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default()
}

/// Response published for every command attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echo of the command's `request_id`
    pub request_id: String,
    /// Whether the action succeeded
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
    /// Device state snapshot after the attempt
    #[serde(default)]
    pub state: StateMap,
    /// Time the response was built
    pub timestamp: DateTime<Utc>,
}

impl ResponseEnvelope {
    /// Successful response.
    pub fn success(request_id: impl Into<String>, message: impl Into<String>, state: StateMap) -> Self {
        Self::new(request_id, true, message, state)
    }

    /// Failed response.
    pub fn failure(request_id: impl Into<String>, message: impl Into<String>, state: StateMap) -> Self {
        Self::new(request_id, false, message, state)
    }

    pub fn new(
        request_id: impl Into<String>,
        success: bool,
        message: impl Into<String>,
        state: StateMap,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            success,
            message: message.into(),
            state,
            timestamp: Utc::now(),
        }
    }

    /// Encode the response as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a response from raw bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}
