//! Message types exchanged with robot agents
//!
//! Commands go out as `{"command": "<verb>"}`; state comes back as whatever
//! JSON the device chooses to publish, kept as a [`serde_json::Value`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Command verb sent to an agent
///
/// Switch-style devices understand `on`/`off`; anything else is passed through
/// verbatim.
///
/// # Examples
/// ```
/// use nest_dispatch::protocol::CommandVerb;
///
/// assert_eq!(CommandVerb::from("on"), CommandVerb::On);
/// assert_eq!(CommandVerb::from("dock").as_str(), "dock");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandVerb {
    On,
    Off,
    Other(String),
}

impl CommandVerb {
    pub fn as_str(&self) -> &str {
        match self {
            CommandVerb::On => "on",
            CommandVerb::Off => "off",
            CommandVerb::Other(verb) => verb,
        }
    }

    /// True for the two verbs a switch-style device accepts
    pub fn is_switch(&self) -> bool {
        matches!(self, CommandVerb::On | CommandVerb::Off)
    }
}

impl From<String> for CommandVerb {
    fn from(verb: String) -> Self {
        match verb.as_str() {
            "on" => CommandVerb::On,
            "off" => CommandVerb::Off,
            _ => CommandVerb::Other(verb),
        }
    }
}

impl From<&str> for CommandVerb {
    fn from(verb: &str) -> Self {
        CommandVerb::from(verb.to_string())
    }
}

impl From<CommandVerb> for String {
    fn from(verb: CommandVerb) -> Self {
        match verb {
            CommandVerb::Other(verb) => verb,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire payload published on an agent's command topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: CommandVerb,
}

impl CommandPayload {
    /// Compact JSON encoding, e.g. `{"command":"on"}`
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// A command as it was handed to the transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub agent_id: String,
    pub verb: CommandVerb,
    pub qos: QosLevel,
    pub published_at: DateTime<Utc>,
    /// What the broker said about the publish
    pub ack: PublishAck,
}

/// Decoded inbound state message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateUpdate {
    pub topic: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    /// Set when the broker delivered a retained message
    pub retained: bool,
}

impl StateUpdate {
    /// The conventional `state` field, if the device reported one
    pub fn state_field(&self) -> Option<&str> {
        self.payload.get("state").and_then(Value::as_str)
    }
}

/// Inbound payload could not be decoded
#[derive(Debug, Error)]
#[error("Malformed state payload on {topic}: {source}")]
pub struct DecodeError {
    pub topic: String,
    #[source]
    pub source: serde_json::Error,
}

/// Decode an inbound state payload as JSON
pub fn decode_state_payload(topic: &str, payload: &[u8]) -> Result<Value, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError {
        topic: topic.to_string(),
        source,
    })
}

/// Publish outcome reported by the transport
///
/// The same tri-state contract applies to every publish path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "delivery", content = "reason", rename_all = "snake_case")]
pub enum PublishAck {
    /// Broker confirmed receipt (PUBACK / PUBREC with a success reason)
    Acknowledged,
    /// Handed to the network, but no acknowledgement was observed
    Unacknowledged,
    /// Broker refused the message, or it never left the client
    Rejected(String),
}

/// Final outcome of a dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Device reported its state after the command
    Confirmed,
    /// Command was sent, no confirmation arrived before the deadline
    Pending,
    /// Broker rejected or failed to accept the command
    DeliveryFailed,
    /// No connection; nothing was published
    NotConnected,
}

/// Caller-facing result of `dispatch_command`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResult {
    pub agent_id: String,
    pub outcome: DispatchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DispatchResult {
    pub fn confirmed(agent_id: &str, update: StateUpdate) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            outcome: DispatchOutcome::Confirmed,
            state: Some(update.payload),
            detail: None,
        }
    }

    pub fn pending(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            outcome: DispatchOutcome::Pending,
            state: None,
            detail: None,
        }
    }

    pub fn delivery_failed<S: Into<String>>(agent_id: &str, detail: S) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            outcome: DispatchOutcome::DeliveryFailed,
            state: None,
            detail: Some(detail.into()),
        }
    }

    pub fn not_connected(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            outcome: DispatchOutcome::NotConnected,
            state: None,
            detail: None,
        }
    }

    /// `state` field of the confirmed payload
    pub fn state_field(&self) -> Option<&str> {
        self.state
            .as_ref()
            .and_then(|state| state.get("state"))
            .and_then(Value::as_str)
    }
}
