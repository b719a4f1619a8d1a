//! Client protocol — correlated commands and per-stream subscriptions over
//! one client transport.
//!
//! A single long-lived reader task decodes every inbound payload and routes
//! it: command results complete the matching pending slot, events land in
//! the matching subscription queue, everything else is dropped. The reader
//! never terminates on malformed input.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;
use uuid::Uuid;

use crate::error::ClientError;
use crate::transport::{ClientTransport, ConnectionState, MessageStream, TransportMessage};
use crate::types::{
    ClientPayload, CommandError, CommandResult, CommandResultMsg, Event, EventMsg, ServerPayload,
    SubscribeMsg, WireCommand,
};

/// Every `send_command` races this fixed deadline.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

type PendingTable = Arc<DashMap<String, oneshot::Sender<CommandResult>>>;
type SubscriptionTable = Arc<DashMap<String, mpsc::UnboundedSender<Event>>>;

/// Client protocol bound to a single transport.
pub struct StrandClient {
    transport: Arc<dyn ClientTransport>,
    pending: PendingTable,
    subscriptions: SubscriptionTable,
    reader: JoinHandle<()>,
}

impl StrandClient {
    /// Attach the protocol to a transport. Spawns the inbound reader.
    pub async fn connect(transport: Arc<dyn ClientTransport>) -> Result<Self, ClientError> {
        let inbound = transport.subscribe(None).await?;
        let pending: PendingTable = Arc::new(DashMap::new());
        let subscriptions: SubscriptionTable = Arc::new(DashMap::new());

        let reader = tokio::spawn(run_reader(
            inbound,
            Arc::clone(&pending),
            Arc::clone(&subscriptions),
        ));

        Ok(Self {
            transport,
            pending,
            subscriptions,
            reader,
        })
    }

    /// Connection-state signal of the underlying transport.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.connection_state()
    }

    /// Publish a command and await its correlated result under the fixed
    /// 10-second deadline. A result arriving after the deadline is
    /// discarded; a concurrent reuse of the same command id is rejected.
    pub async fn send_command(&self, command: WireCommand) -> Result<CommandResult, ClientError> {
        let command_id = command.id.clone();
        let payload = serde_json::to_string(&ClientPayload::Command(command))?;

        let (slot, completion) = oneshot::channel();
        match self.pending.entry(command_id.clone()) {
            Entry::Occupied(_) => return Err(ClientError::DuplicateCommand(command_id)),
            Entry::Vacant(entry) => {
                entry.insert(slot);
            }
        }
        // Removes the pending entry on every exit path the reader did not
        // already handle — timeout, transport failure, caller cancellation.
        let mut guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            command_id: command_id.clone(),
            armed: true,
        };

        let message = TransportMessage::new(command_id.clone(), "command", payload);
        self.transport.publish(message).await?;

        match time::timeout(COMMAND_TIMEOUT, completion).await {
            Ok(Ok(result)) => {
                // The reader removed the entry before completing the slot.
                guard.armed = false;
                Ok(result)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ClientError::CommandTimeout {
                command_id,
                timeout_ms: COMMAND_TIMEOUT.as_millis() as u64,
            }),
        }
    }

    /// Subscribe to one stream's events. At most one active subscription per
    /// stream id per client; the returned handle unregisters itself when
    /// dropped.
    pub async fn subscribe(
        &self,
        stream_id: impl Into<String>,
    ) -> Result<Subscription, ClientError> {
        let stream_id = stream_id.into();
        let payload = serde_json::to_string(&ClientPayload::Subscribe(SubscribeMsg {
            stream_id: stream_id.clone(),
        }))?;

        let (queue, events) = mpsc::unbounded_channel();
        match self.subscriptions.entry(stream_id.clone()) {
            Entry::Occupied(_) => return Err(ClientError::DuplicateSubscription(stream_id)),
            Entry::Vacant(entry) => {
                entry.insert(queue);
            }
        }

        let message = TransportMessage::new(Uuid::new_v4().to_string(), "subscribe", payload);
        if let Err(err) = self.transport.publish(message).await {
            self.subscriptions.remove(&stream_id);
            return Err(err.into());
        }

        Ok(Subscription {
            stream_id,
            events,
            subscriptions: Arc::clone(&self.subscriptions),
        })
    }

    /// Stop the reader and disconnect the transport. Outstanding
    /// `send_command` calls terminate through their deadline.
    pub async fn close(&self) {
        self.reader.abort();
        self.transport.close().await;
    }
}

impl Drop for StrandClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct PendingGuard {
    pending: PendingTable,
    command_id: String,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pending.remove(&self.command_id);
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Subscriptions
// ═══════════════════════════════════════════════════════════════

/// A live stream subscription. Draining it yields events in server
/// publication order; dropping it removes the client-side queue, after
/// which re-subscribing to the same stream starts a fresh sequence.
#[derive(Debug)]
pub struct Subscription {
    stream_id: String,
    events: mpsc::UnboundedReceiver<Event>,
    subscriptions: SubscriptionTable,
}

impl Subscription {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Next event, or `None` once the protocol has shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscriptions.remove(&self.stream_id);
    }
}

// ═══════════════════════════════════════════════════════════════
// Inbound reader
// ═══════════════════════════════════════════════════════════════

async fn run_reader(
    mut inbound: MessageStream,
    pending: PendingTable,
    subscriptions: SubscriptionTable,
) {
    while let Some(message) = inbound.next().await {
        let payload: ServerPayload = match serde_json::from_str(&message.payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(message_id = %message.id, error = %err, "dropping malformed message");
                continue;
            }
        };
        match payload {
            ServerPayload::CommandResult(result) => complete_pending(result, &pending),
            ServerPayload::Event(event) => route_event(event, &subscriptions),
        }
    }
    debug!("client reader stopped");
}

fn complete_pending(result: CommandResultMsg, pending: &PendingTable) {
    // An inconsistent message (success without position, failure without
    // error) is dropped without touching the pending slot; the command is
    // left to its deadline.
    let completion = if result.success {
        match result.position {
            Some(position) => CommandResult::Success { position },
            None => {
                debug!(command_id = %result.command_id, "success result without position");
                return;
            }
        }
    } else {
        match result.error {
            Some(message) => CommandResult::Failure {
                error: CommandError::Unknown {
                    command_id: result.command_id.clone(),
                    message,
                },
            },
            None => {
                debug!(command_id = %result.command_id, "failure result without error");
                return;
            }
        }
    };

    if let Some((_, slot)) = pending.remove(&result.command_id) {
        // The caller may have timed out between removal and completion;
        // the late result is then discarded with the slot.
        let _ = slot.send(completion);
    }
}

fn route_event(event: EventMsg, subscriptions: &SubscriptionTable) {
    if let Some(queue) = subscriptions.get(&event.stream_id) {
        let _ = queue.send(Event {
            position: event.position,
            event_type: event.event_type,
            data: event.data,
            timestamp: event.timestamp,
        });
    }
}
