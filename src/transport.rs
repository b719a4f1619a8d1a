//! Transport abstraction — a message-oriented duplex channel.
//!
//! A client transport carries opaque `{id, type, payload}` records to and
//! from one peer and signals its connection state. A server transport hands
//! out newly accepted client connections and can broadcast to all of them.
//! The in-memory implementation lives in [`crate::memory`], the WebSocket
//! one in [`crate::ws`]; both are built on the [`Fanout`] defined here.
//!
//! Ordering contract: messages published by a single producer are delivered
//! to each subscriber in publication order. Across producers there is no
//! global order.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::error::TransportError;

// ═══════════════════════════════════════════════════════════════
// Wire envelope
// ═══════════════════════════════════════════════════════════════

/// The unit every transport moves: an envelope with a JSON text payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: String,
}

impl TransportMessage {
    pub fn new(
        id: impl Into<String>,
        msg_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            msg_type: msg_type.into(),
            payload: payload.into(),
        }
    }
}

/// Lifecycle of one transport endpoint. Once `Disconnected` is observed the
/// endpoint never becomes connected again; callers reconnect by building a
/// fresh transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Identifies one client connection for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════
// Contracts
// ═══════════════════════════════════════════════════════════════

/// Mark an endpoint disconnected. Idempotent: observers see at most one
/// transition to `Disconnected`.
pub(crate) fn mark_disconnected(state: &watch::Sender<ConnectionState>) {
    state.send_if_modified(|state| {
        if *state == ConnectionState::Disconnected {
            false
        } else {
            *state = ConnectionState::Disconnected;
            true
        }
    });
}

/// Predicate applied to inbound messages by a filtered subscription.
pub type MessageFilter = Arc<dyn Fn(&TransportMessage) -> bool + Send + Sync>;

/// Lazy inbound message sequence. Not restartable once consumed.
pub type MessageStream = BoxStream<'static, TransportMessage>;

/// Lazy sequence of accepted client connections.
pub type ConnectionStream = BoxStream<'static, ClientConnection>;

/// One end of a duplex message channel.
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Connection-state signal. The receiver observes the current state
    /// immediately (`borrow`) and every transition afterwards (`changed`).
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Deliver a message to the peer. Fails unless the state is `Connected`.
    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError>;

    /// Subscribe to inbound messages, optionally filtered. Multiple
    /// concurrent subscribers each observe every (matching) message from the
    /// moment they subscribe.
    async fn subscribe(&self, filter: Option<MessageFilter>)
        -> Result<MessageStream, TransportError>;

    /// Transition to `Disconnected` and release the endpoint's queues.
    async fn close(&self);
}

/// A newly accepted connection: its id plus the server's transport view of
/// that client (publish reaches the client, subscribe reads from it).
#[derive(Clone)]
pub struct ClientConnection {
    pub client_id: ClientId,
    pub transport: Arc<dyn ClientTransport>,
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// The accepting end of a transport.
#[async_trait]
pub trait ServerTransport: Send + Sync + 'static {
    /// The stream of newly accepted connections. Single consumer: claiming
    /// it a second time fails with [`TransportError::ConnectionsClaimed`].
    fn connections(&self) -> Result<ConnectionStream, TransportError>;

    /// Deliver a message to every currently connected client. Clients that
    /// disconnect mid-broadcast are skipped.
    async fn broadcast(&self, message: TransportMessage) -> Result<(), TransportError>;

    /// Disconnect every client and stop accepting new connections.
    async fn close(&self);
}

// ═══════════════════════════════════════════════════════════════
// Fan-out plumbing
// ═══════════════════════════════════════════════════════════════

/// One direction of a connection: an unbounded source queue plus a copier
/// task that distributes each message to every active subscriber queue.
///
/// Messages pushed before the first subscriber arrives are held back and
/// handed to it, so a protocol reader that attaches shortly after the
/// connection is wired never loses the opening messages.
pub(crate) struct Fanout {
    tx: mpsc::UnboundedSender<TransportMessage>,
    shared: Arc<Mutex<FanoutState>>,
}

#[derive(Default)]
struct FanoutState {
    backlog: Vec<TransportMessage>,
    subscribers: Vec<FanoutSubscriber>,
    closed: bool,
}

struct FanoutSubscriber {
    tx: mpsc::UnboundedSender<TransportMessage>,
    filter: Option<MessageFilter>,
}

impl FanoutSubscriber {
    fn accepts(&self, message: &TransportMessage) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(message))
    }
}

impl Fanout {
    /// Must be called within a tokio runtime; spawns the copier task.
    pub(crate) fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TransportMessage>();
        let shared = Arc::new(Mutex::new(FanoutState::default()));

        let state = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut state = state.lock().await;
                if state.closed {
                    break;
                }
                if state.subscribers.is_empty() {
                    state.backlog.push(message);
                    continue;
                }
                state.subscribers.retain(|sub| {
                    if !sub.accepts(&message) {
                        return !sub.tx.is_closed();
                    }
                    sub.tx.send(message.clone()).is_ok()
                });
            }
            // Source gone: end every subscriber stream.
            let mut state = state.lock().await;
            state.closed = true;
            state.subscribers.clear();
        });

        Self { tx, shared }
    }

    /// Enqueue a message for distribution.
    pub(crate) fn push(&self, message: TransportMessage) -> Result<(), TransportError> {
        Ok(self.tx.send(message)?)
    }

    /// Allocate a subscriber queue. The first subscriber also receives the
    /// held-back backlog. On a closed fan-out the stream ends immediately.
    pub(crate) async fn subscribe(&self, filter: Option<MessageFilter>) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.lock().await;
        if !state.closed {
            for message in state.backlog.drain(..) {
                let matches = filter.as_ref().map_or(true, |f| f(&message));
                if matches {
                    let _ = tx.send(message);
                }
            }
            state.subscribers.push(FanoutSubscriber { tx, filter });
        }
        UnboundedReceiverStream::new(rx).boxed()
    }

    /// Drop all subscribers and refuse further distribution.
    pub(crate) async fn close(&self) {
        let mut state = self.shared.lock().await;
        state.closed = true;
        state.subscribers.clear();
        state.backlog.clear();
    }
}
