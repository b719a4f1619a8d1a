//! Wire protocol and domain types.
//!
//! Covers both directions of the relay protocol — `command` / `subscribe`
//! inbound, `command_result` / `event` outbound — plus the in-process
//! surface of the command registry ([`CommandResult`], [`CommandError`]).
//! Every message payload is JSON; the `type` field dispatches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ═══════════════════════════════════════════════════════════════
// Client → Server messages
// ═══════════════════════════════════════════════════════════════

/// Top-level payload from a client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientPayload {
    Command(WireCommand),
    Subscribe(SubscribeMsg),
}

/// An untrusted external command envelope. The payload is opaque until the
/// registry has decoded it against the definition registered for `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireCommand {
    pub id: String,
    /// The aggregate the command addresses.
    pub target: String,
    pub name: String,
    pub payload: JsonValue,
}

/// Declares interest in events of one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeMsg {
    pub stream_id: String,
}

// ═══════════════════════════════════════════════════════════════
// Server → Client messages
// ═══════════════════════════════════════════════════════════════

/// Top-level payload sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPayload {
    CommandResult(CommandResultMsg),
    Event(EventMsg),
}

/// Correlated answer to a `command` message.
///
/// `success: true` carries `position`; `success: false` carries `error`, a
/// string that typically holds a JSON-serialized [`CommandError`]. A message
/// violating that pairing is dropped by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultMsg {
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<EventStreamPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An event fanned out to stream subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMsg {
    pub stream_id: String,
    pub position: EventStreamPosition,
    pub event_type: String,
    pub data: JsonValue,
    pub timestamp: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════
// Streams and events
// ═══════════════════════════════════════════════════════════════

/// A point in an event stream. `event_number` is monotonic per stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStreamPosition {
    pub stream_id: String,
    pub event_number: u64,
}

impl EventStreamPosition {
    pub fn new(stream_id: impl Into<String>, event_number: u64) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_number,
        }
    }
}

/// A delivered event, as seen by a subscription consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub position: EventStreamPosition,
    pub event_type: String,
    pub data: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// The stream this event belongs to.
    pub fn stream_id(&self) -> &str {
        &self.position.stream_id
    }
}

// ═══════════════════════════════════════════════════════════════
// Command dispatch surface
// ═══════════════════════════════════════════════════════════════

/// A wire command whose payload has passed its definition's schema.
#[derive(Debug, Clone)]
pub struct DomainCommand<P> {
    pub id: String,
    pub target: String,
    pub name: String,
    pub payload: P,
}

/// Outcome of dispatching one command. Always a value, never a panic —
/// the registry reifies every failure mode into the `Failure` variant.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Success { position: EventStreamPosition },
    Failure { error: CommandError },
}

impl CommandResult {
    pub fn success(position: EventStreamPosition) -> Self {
        Self::Success { position }
    }

    pub fn failure(error: CommandError) -> Self {
        Self::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Why a command failed. Serialized (tagged by `type`) into the `error`
/// string of a `command_result` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandError {
    #[serde(rename = "ValidationError", rename_all = "camelCase")]
    Validation {
        command_id: String,
        command_name: String,
        errors: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    HandlerNotFound {
        command_id: String,
        command_name: String,
        available_handlers: Vec<String>,
    },
    #[serde(rename = "ExecutionError", rename_all = "camelCase")]
    Execution {
        command_id: String,
        command_name: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    AggregateNotFound {
        command_id: String,
        target: String,
    },
    #[serde(rename_all = "camelCase")]
    ConcurrencyConflict {
        expected_version: u64,
        actual_version: u64,
    },
    #[serde(rename = "UnknownError", rename_all = "camelCase")]
    Unknown {
        command_id: String,
        message: String,
    },
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::HandlerNotFound { .. } => "HandlerNotFound",
            Self::Execution { .. } => "ExecutionError",
            Self::AggregateNotFound { .. } => "AggregateNotFound",
            Self::ConcurrencyConflict { .. } => "ConcurrencyConflict",
            Self::Unknown { .. } => "UnknownError",
        }
    }
}
