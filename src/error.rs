//! Error types for strand.
//!
//! Domain failures (validation, unknown command, handler defects) are never
//! errors — they travel as [`CommandResult::Failure`](crate::types::CommandResult)
//! values. The enums here cover the operations themselves: a transport that
//! cannot deliver, a registry that cannot be built, a command that never got
//! an answer.

use tokio::sync::{mpsc, oneshot};

/// Failures of the message transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    Disconnected,

    #[error("transport is closed")]
    Closed,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server's connection stream is single-consumer.
    #[error("connection stream already claimed")]
    ConnectionsClaimed,
}

/// Construction-time failures of a [`CommandRegistry`](crate::registry::CommandRegistry).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate command definition: {0}")]
    DuplicateCommand(String),
}

/// Failures of client protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("command {command_id} timed out after {timeout_ms}ms")]
    CommandTimeout { command_id: String, timeout_ms: u64 },

    /// A command with this id is already awaiting a result.
    #[error("command {0} is already pending")]
    DuplicateCommand(String),

    /// An active subscription for this stream already exists.
    #[error("already subscribed to stream {0}")]
    DuplicateSubscription(String),

    /// The protocol reader stopped before the command completed.
    #[error("client protocol closed")]
    ProtocolClosed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of server protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The inbound command stream is single-consumer.
    #[error("command stream already claimed")]
    CommandsClaimed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<oneshot::error::RecvError> for ClientError {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::ProtocolClosed
    }
}

impl<T> From<mpsc::error::SendError<T>> for TransportError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::Closed
    }
}
