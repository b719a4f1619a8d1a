//! In-memory transport — the reference implementation.
//!
//! Each accepted connection is a [`Link`]: two directional fan-outs (one per
//! message direction) sharing a single connection-state signal. The server
//! transport keeps every live link in a table for broadcast and hands the
//! server-facing view of new links to the accept stream.
//!
//! Closing the server transitions every client to `Disconnected` and fails
//! pending publishes; closing one client releases its queues and removes it
//! from the server's table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::TransportError;
use crate::transport::{
    mark_disconnected, ClientConnection, ClientId, ClientTransport, ConnectionState,
    ConnectionStream, Fanout, MessageFilter, MessageStream, ServerTransport, TransportMessage,
};

/// Queues and state shared by the two views of one connection.
struct Link {
    client_id: ClientId,
    /// Messages travelling client → server.
    c2s: Fanout,
    /// Messages travelling server → client.
    s2c: Fanout,
    state: watch::Sender<ConnectionState>,
}

impl Link {
    fn new(client_id: ClientId) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Connected);
        Arc::new(Self {
            client_id,
            c2s: Fanout::new(),
            s2c: Fanout::new(),
            state,
        })
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    async fn disconnect(&self) {
        mark_disconnected(&self.state);
        self.c2s.close().await;
        self.s2c.close().await;
    }
}

async fn detach(link: &Link, server: &Weak<InMemoryServerTransport>) {
    link.disconnect().await;
    if let Some(server) = server.upgrade() {
        server.connections.remove(&link.client_id);
    }
}

// ═══════════════════════════════════════════════════════════════
// Server side
// ═══════════════════════════════════════════════════════════════

/// Accepting end of the in-memory transport. Clients dial in with
/// [`connect`](InMemoryServerTransport::connect).
pub struct InMemoryServerTransport {
    connections: DashMap<ClientId, Arc<Link>>,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<ClientConnection>>>,
    accept_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientConnection>>>,
    closed: AtomicBool,
}

impl InMemoryServerTransport {
    pub fn new() -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connections: DashMap::new(),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: Mutex::new(Some(accept_rx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Wire up a new client connection: both directions are live once this
    /// returns, and the server-facing view is emitted on the accept stream.
    pub async fn connect(
        self: &Arc<Self>,
    ) -> Result<Arc<InMemoryClientTransport>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let client_id = ClientId::new();
        let link = Link::new(client_id);
        self.connections.insert(client_id, Arc::clone(&link));

        let server_view = Arc::new(InMemoryServerConnection {
            link: Arc::clone(&link),
            server: Arc::downgrade(self),
        });

        let accepted = {
            let guard = self.accept_tx.lock().await;
            match guard.as_ref() {
                Some(accept_tx) => accept_tx
                    .send(ClientConnection {
                        client_id,
                        transport: server_view,
                    })
                    .is_ok(),
                None => false,
            }
        };
        if !accepted {
            // Nobody is accepting; undo the registration.
            self.connections.remove(&client_id);
            link.disconnect().await;
            return Err(TransportError::Closed);
        }

        Ok(Arc::new(InMemoryClientTransport {
            link,
            server: Arc::downgrade(self),
        }))
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl ServerTransport for InMemoryServerTransport {
    fn connections(&self) -> Result<ConnectionStream, TransportError> {
        let mut slot = self
            .accept_rx
            .try_lock()
            .map_err(|_| TransportError::ConnectionsClaimed)?;
        let accept_rx = slot.take().ok_or(TransportError::ConnectionsClaimed)?;
        Ok(UnboundedReceiverStream::new(accept_rx).boxed())
    }

    async fn broadcast(&self, message: TransportMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        for entry in self.connections.iter() {
            let link = entry.value();
            if link.is_connected() {
                let _ = link.s2c.push(message.clone());
            }
        }
        Ok(())
    }

    /// Disconnect every client and end the accept stream.
    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.accept_tx.lock().await.take();

        let links: Vec<Arc<Link>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();
        for link in links {
            link.disconnect().await;
        }
    }
}

/// The server's view of one accepted client: publish reaches the client,
/// subscribe reads what the client sent.
struct InMemoryServerConnection {
    link: Arc<Link>,
    server: Weak<InMemoryServerTransport>,
}

#[async_trait]
impl ClientTransport for InMemoryServerConnection {
    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }

    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError> {
        if !self.link.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.link.s2c.push(message)
    }

    async fn subscribe(
        &self,
        filter: Option<MessageFilter>,
    ) -> Result<MessageStream, TransportError> {
        Ok(self.link.c2s.subscribe(filter).await)
    }

    async fn close(&self) {
        detach(&self.link, &self.server).await;
    }
}

// ═══════════════════════════════════════════════════════════════
// Client side
// ═══════════════════════════════════════════════════════════════

/// The client's end of an in-memory connection.
pub struct InMemoryClientTransport {
    link: Arc<Link>,
    server: Weak<InMemoryServerTransport>,
}

#[async_trait]
impl ClientTransport for InMemoryClientTransport {
    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }

    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError> {
        if !self.link.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.link.c2s.push(message)
    }

    async fn subscribe(
        &self,
        filter: Option<MessageFilter>,
    ) -> Result<MessageStream, TransportError> {
        Ok(self.link.s2c.subscribe(filter).await)
    }

    async fn close(&self) {
        detach(&self.link, &self.server).await;
    }
}
