//! WebSocket transport.
//!
//! Upholds the same contract as the in-memory transport over real sockets:
//! axum upgrade handler on the server side, tungstenite on the client side.
//! Frames carry a [`TransportMessage`] as JSON text; malformed frames are
//! dropped. A transport instance connects once — on socket loss it
//! transitions to `Disconnected` and stays there; reconnection means
//! building a fresh transport.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{
    mark_disconnected, ClientConnection, ClientId, ClientTransport, ConnectionState,
    ConnectionStream, Fanout, MessageFilter, MessageStream, ServerTransport, TransportMessage,
};

// ═══════════════════════════════════════════════════════════════
// Server side
// ═══════════════════════════════════════════════════════════════

/// Accepting end of the WebSocket transport. Route `ws_handler` at it:
///
/// ```ignore
/// let transport = WsServerTransport::new();
/// let app = Router::new().route("/ws", get(ws::ws_handler)).with_state(transport);
/// ```
pub struct WsServerTransport {
    connections: DashMap<ClientId, Arc<WsServerConnection>>,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<ClientConnection>>>,
    accept_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientConnection>>>,
}

impl WsServerTransport {
    pub fn new() -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connections: DashMap::new(),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: Mutex::new(Some(accept_rx)),
        })
    }
}

#[async_trait]
impl ServerTransport for WsServerTransport {
    fn connections(&self) -> Result<ConnectionStream, TransportError> {
        let mut slot = self
            .accept_rx
            .try_lock()
            .map_err(|_| TransportError::ConnectionsClaimed)?;
        let accept_rx = slot.take().ok_or(TransportError::ConnectionsClaimed)?;
        Ok(UnboundedReceiverStream::new(accept_rx).boxed())
    }

    async fn broadcast(&self, message: TransportMessage) -> Result<(), TransportError> {
        for entry in self.connections.iter() {
            let connection = entry.value();
            if *connection.state.borrow() == ConnectionState::Connected {
                let _ = connection.outbound.send(message.clone());
            }
        }
        Ok(())
    }

    /// Disconnect every client and stop accepting new ones. The HTTP
    /// listener itself is owned by the caller.
    async fn close(&self) {
        self.accept_tx.lock().await.take();
        let connections: Vec<Arc<WsServerConnection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for connection in connections {
            mark_disconnected(&connection.state);
        }
    }
}

/// The server's transport view of one connected socket.
struct WsServerConnection {
    /// Messages read from the socket, fanned out to protocol subscribers.
    inbound: Fanout,
    /// Messages queued for the socket writer.
    outbound: mpsc::UnboundedSender<TransportMessage>,
    state: watch::Sender<ConnectionState>,
}

#[async_trait]
impl ClientTransport for WsServerConnection {
    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(TransportError::Disconnected);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Disconnected)
    }

    async fn subscribe(
        &self,
        filter: Option<MessageFilter>,
    ) -> Result<MessageStream, TransportError> {
        Ok(self.inbound.subscribe(filter).await)
    }

    async fn close(&self) {
        mark_disconnected(&self.state);
    }
}

/// Axum handler for the WebSocket route — upgrades and hands the socket to
/// the per-connection loop.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(transport): State<Arc<WsServerTransport>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, transport))
}

/// Per-socket loop: pump the outbound queue into the sink, push received
/// frames into the inbound fan-out, leave on close or disconnect signal.
async fn handle_socket(socket: WebSocket, transport: Arc<WsServerTransport>) {
    let client_id = ClientId::new();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (state_tx, _) = watch::channel(ConnectionState::Connected);

    let connection = Arc::new(WsServerConnection {
        inbound: Fanout::new(),
        outbound: outbound_tx,
        state: state_tx,
    });
    transport
        .connections
        .insert(client_id, Arc::clone(&connection));

    let accepted = {
        let guard = transport.accept_tx.lock().await;
        match guard.as_ref() {
            Some(accept_tx) => accept_tx
                .send(ClientConnection {
                    client_id,
                    transport: Arc::clone(&connection) as Arc<dyn ClientTransport>,
                })
                .is_ok(),
            None => false,
        }
    };
    if !accepted {
        transport.connections.remove(&client_id);
        return;
    }

    info!(client_id = %client_id, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut state_rx = connection.state.subscribe();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                Some(message) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(client_id = %client_id, error = %err, "failed to encode frame");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<TransportMessage>(&text) {
                        Ok(message) => {
                            let _ = connection.inbound.push(message);
                        }
                        Err(err) => {
                            debug!(client_id = %client_id, error = %err, "dropping malformed frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => { /* ping/pong handled by axum, binary ignored */ }
                Some(Err(err)) => {
                    warn!(client_id = %client_id, "ws recv error: {err}");
                    break;
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_disconnected = *state_rx.borrow() == ConnectionState::Disconnected;
                if is_disconnected {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    mark_disconnected(&connection.state);
    connection.inbound.close().await;
    transport.connections.remove(&client_id);
    info!(client_id = %client_id, "websocket client disconnected");
}

// ═══════════════════════════════════════════════════════════════
// Client side
// ═══════════════════════════════════════════════════════════════

/// Client end of the WebSocket transport.
pub struct WsClientTransport {
    state: Arc<watch::Sender<ConnectionState>>,
    inbound: Arc<Fanout>,
    outbound: mpsc::UnboundedSender<TransportMessage>,
}

impl WsClientTransport {
    /// Dial the server. The returned transport is `Connected`; it becomes
    /// `Disconnected` exactly once, on socket loss or `close`.
    pub async fn connect(url: &str) -> Result<Arc<Self>, TransportError> {
        let state = Arc::new(watch::channel(ConnectionState::Connecting).0);

        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;
        state.send_replace(ConnectionState::Connected);
        info!(url, "websocket connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let inbound = Arc::new(Fanout::new());

        tokio::spawn(run_socket(
            stream,
            outbound_rx,
            Arc::clone(&inbound),
            Arc::clone(&state),
        ));

        Ok(Arc::new(Self {
            state,
            inbound,
            outbound: outbound_tx,
        }))
    }
}

#[async_trait]
impl ClientTransport for WsClientTransport {
    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(TransportError::Disconnected);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Disconnected)
    }

    async fn subscribe(
        &self,
        filter: Option<MessageFilter>,
    ) -> Result<MessageStream, TransportError> {
        Ok(self.inbound.subscribe(filter).await)
    }

    async fn close(&self) {
        mark_disconnected(&self.state);
    }
}

/// Background task owning the socket: forwards the outbound queue, pushes
/// received frames into the inbound fan-out.
async fn run_socket(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound_rx: mpsc::UnboundedReceiver<TransportMessage>,
    inbound: Arc<Fanout>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    use tokio_tungstenite::tungstenite::Message;

    let (mut ws_tx, mut ws_rx) = stream.split();
    let mut state_rx = state.subscribe();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                Some(message) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(error = %err, "failed to encode frame");
                            continue;
                        }
                    };
                    if let Err(err) = ws_tx.send(Message::Text(json.into())).await {
                        warn!("ws send error: {err}");
                        break;
                    }
                }
                None => break,
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<TransportMessage>(&text) {
                        Ok(message) => {
                            let _ = inbound.push(message);
                        }
                        Err(err) => debug!(error = %err, "dropping malformed frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("server closed connection");
                    break;
                }
                Some(Ok(_)) => { /* ping/pong/binary */ }
                Some(Err(err)) => {
                    warn!("ws recv error: {err}");
                    break;
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_disconnected = *state_rx.borrow() == ConnectionState::Disconnected;
                if is_disconnected {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    mark_disconnected(&state);
    inbound.close().await;
}
