//! Server protocol — fan-in of inbound commands, fan-out of event
//! broadcasts, per-client subscription bookkeeping.
//!
//! Flow per connection:
//! 1. The supervisor accepts it from the transport's connection stream
//! 2. A forked reader decodes `command` and `subscribe` messages
//! 3. On disconnect the client is purged from every subscription set

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ServerError;
use crate::registry::CommandRegistry;
use crate::transport::{
    ClientConnection, ClientId, ConnectionState, ConnectionStream, ServerTransport,
    TransportMessage,
};
use crate::types::{
    ClientPayload, CommandResult, CommandResultMsg, Event, EventMsg, ServerPayload, WireCommand,
};

/// Lazy sequence of commands received from all connected clients.
pub type CommandStream = BoxStream<'static, WireCommand>;

type SubscriptionTable = Arc<DashMap<String, HashSet<ClientId>>>;

type ReaderTable = Arc<DashMap<ClientId, JoinHandle<()>>>;

/// Server protocol bound to a single server transport.
pub struct StrandServer {
    transport: Arc<dyn ServerTransport>,
    subscriptions: SubscriptionTable,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<WireCommand>>>,
    supervisor: JoinHandle<()>,
    readers: ReaderTable,
}

impl StrandServer {
    /// Attach the protocol to a transport and start accepting connections.
    pub fn start(transport: Arc<dyn ServerTransport>) -> Result<Arc<Self>, ServerError> {
        let connections = transport.connections()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let subscriptions: SubscriptionTable = Arc::new(DashMap::new());
        let readers: ReaderTable = Arc::new(DashMap::new());

        let supervisor = tokio::spawn(run_supervisor(
            connections,
            command_tx,
            Arc::clone(&subscriptions),
            Arc::clone(&readers),
        ));

        Ok(Arc::new(Self {
            transport,
            subscriptions,
            command_rx: Mutex::new(Some(command_rx)),
            supervisor,
            readers,
        }))
    }

    /// Claim the inbound command stream. Single consumer; a second claim
    /// fails with [`ServerError::CommandsClaimed`].
    pub fn commands(&self) -> Result<CommandStream, ServerError> {
        let mut slot = self
            .command_rx
            .try_lock()
            .map_err(|_| ServerError::CommandsClaimed)?;
        let command_rx = slot.take().ok_or(ServerError::CommandsClaimed)?;
        Ok(UnboundedReceiverStream::new(command_rx).boxed())
    }

    /// Answer a command. The result is broadcast: clients discard results
    /// for command ids they are not awaiting, so correctness is preserved.
    /// (Unicast to the originating client is an allowed optimization.)
    pub async fn send_result(
        &self,
        command_id: &str,
        result: CommandResult,
    ) -> Result<(), ServerError> {
        let msg = match result {
            CommandResult::Success { position } => CommandResultMsg {
                command_id: command_id.into(),
                success: true,
                position: Some(position),
                error: None,
            },
            CommandResult::Failure { error } => {
                debug!(command_id, kind = error.kind(), "command failed");
                CommandResultMsg {
                    command_id: command_id.into(),
                    success: false,
                    position: None,
                    error: Some(serde_json::to_string(&error)?),
                }
            }
        };
        let payload = serde_json::to_string(&ServerPayload::CommandResult(msg))?;
        self.transport
            .broadcast(TransportMessage::new(
                Uuid::new_v4().to_string(),
                "command_result",
                payload,
            ))
            .await?;
        Ok(())
    }

    /// Fan an event out to its stream's subscribers. A stream nobody
    /// subscribed to is a no-op.
    pub async fn publish_event(&self, event: Event) -> Result<(), ServerError> {
        let has_subscribers = self
            .subscriptions
            .get(event.stream_id())
            .map(|members| !members.is_empty())
            .unwrap_or(false);
        if !has_subscribers {
            return Ok(());
        }

        let msg = EventMsg {
            stream_id: event.position.stream_id.clone(),
            position: event.position,
            event_type: event.event_type,
            data: event.data,
            timestamp: event.timestamp,
        };
        let payload = serde_json::to_string(&ServerPayload::Event(msg))?;
        self.transport
            .broadcast(TransportMessage::new(
                Uuid::new_v4().to_string(),
                "event",
                payload,
            ))
            .await?;
        Ok(())
    }

    /// How many clients are subscribed to a stream.
    pub fn subscriber_count(&self, stream_id: &str) -> usize {
        self.subscriptions
            .get(stream_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Shut down: stop the supervisor, close the transport (disconnecting
    /// every client), and abort the per-connection readers.
    pub async fn close(&self) {
        self.supervisor.abort();
        self.transport.close().await;
        self.readers.retain(|_, reader| {
            reader.abort();
            false
        });
    }
}

impl Drop for StrandServer {
    fn drop(&mut self) {
        self.supervisor.abort();
        for entry in self.readers.iter() {
            entry.value().abort();
        }
    }
}

/// Drain inbound commands through a registry, answering each with its
/// result. Runs until the command stream or the transport closes.
pub async fn run_dispatcher(
    server: Arc<StrandServer>,
    registry: Arc<CommandRegistry>,
) -> Result<(), ServerError> {
    let mut commands = server.commands()?;
    while let Some(command) = commands.next().await {
        let command_id = command.id.clone();
        let result = registry.dispatch(command).await;
        server.send_result(&command_id, result).await?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// Connection supervision
// ═══════════════════════════════════════════════════════════════

async fn run_supervisor(
    mut connections: ConnectionStream,
    command_tx: mpsc::UnboundedSender<WireCommand>,
    subscriptions: SubscriptionTable,
    readers: ReaderTable,
) {
    while let Some(connection) = connections.next().await {
        let client_id = connection.client_id;
        info!(client_id = %client_id, "client connected");

        let reader = tokio::spawn({
            let command_tx = command_tx.clone();
            let subscriptions = Arc::clone(&subscriptions);
            let readers = Arc::clone(&readers);
            async move {
                run_connection(connection, command_tx, subscriptions).await;
                readers.remove(&client_id);
            }
        });
        readers.insert(client_id, reader);
    }
    debug!("connection stream ended, supervisor stopping");
}

/// Per-connection reader: Ready as soon as it is forked, Closed on
/// transport disconnect, at which point the client's subscriptions are
/// purged.
async fn run_connection(
    connection: ClientConnection,
    command_tx: mpsc::UnboundedSender<WireCommand>,
    subscriptions: SubscriptionTable,
) {
    let client_id = connection.client_id;
    let mut state = connection.transport.connection_state();
    let mut inbound = match connection.transport.subscribe(None).await {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!(client_id = %client_id, error = %err, "could not read from connection");
            purge_subscriptions(client_id, &subscriptions);
            return;
        }
    };

    loop {
        tokio::select! {
            message = inbound.next() => match message {
                Some(message) => {
                    handle_client_message(message, client_id, &command_tx, &subscriptions);
                }
                None => break,
            },
            changed = state.wait_for(|s| *s == ConnectionState::Disconnected) => {
                let _ = changed;
                break;
            }
        }
    }

    purge_subscriptions(client_id, &subscriptions);
    info!(client_id = %client_id, "client disconnected");
}

fn handle_client_message(
    message: TransportMessage,
    client_id: ClientId,
    command_tx: &mpsc::UnboundedSender<WireCommand>,
    subscriptions: &SubscriptionTable,
) {
    let payload: ClientPayload = match serde_json::from_str(&message.payload) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(client_id = %client_id, message_id = %message.id, error = %err,
                "dropping malformed message");
            return;
        }
    };
    match payload {
        ClientPayload::Command(command) => {
            let _ = command_tx.send(command);
        }
        ClientPayload::Subscribe(sub) => {
            debug!(client_id = %client_id, stream_id = %sub.stream_id, "subscribed");
            subscriptions
                .entry(sub.stream_id)
                .or_default()
                .insert(client_id);
        }
    }
}

fn purge_subscriptions(client_id: ClientId, subscriptions: &SubscriptionTable) {
    subscriptions.retain(|_, members| {
        members.remove(&client_id);
        !members.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StrandClient;
    use crate::error::{ClientError, TransportError};
    use crate::memory::InMemoryServerTransport;
    use crate::registry::{CommandPayload, CommandRegistry};
    use crate::types::{CommandError, DomainCommand, EventStreamPosition};
    use chrono::{DateTime, Utc};
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct UpdateProfile {
        name: String,
    }

    impl CommandPayload for UpdateProfile {
        fn check(&self) -> Vec<String> {
            if self.name.is_empty() {
                vec!["name must not be empty".into()]
            } else {
                Vec::new()
            }
        }
    }

    struct Harness {
        transport: Arc<InMemoryServerTransport>,
        server: Arc<StrandServer>,
    }

    /// In-memory server with a dispatcher answering `UpdateProfile` with
    /// `Success(position(target, 42))`.
    async fn start_relay() -> Harness {
        let transport = InMemoryServerTransport::new();
        let server =
            StrandServer::start(transport.clone() as Arc<dyn ServerTransport>).unwrap();

        let registry = Arc::new(
            CommandRegistry::builder()
                .define(
                    "UpdateProfile",
                    |cmd: DomainCommand<UpdateProfile>| async move {
                        CommandResult::success(EventStreamPosition::new(cmd.target, 42))
                    },
                )
                .build()
                .unwrap(),
        );
        tokio::spawn(run_dispatcher(Arc::clone(&server), registry));

        Harness { transport, server }
    }

    async fn connect_client(harness: &Harness) -> StrandClient {
        let transport = harness.transport.connect().await.unwrap();
        StrandClient::connect(transport).await.unwrap()
    }

    fn ts(text: &str) -> DateTime<Utc> {
        text.parse().unwrap()
    }

    fn event(stream: &str, n: u64, event_type: &str, timestamp: &str) -> Event {
        Event {
            position: EventStreamPosition::new(stream, n),
            event_type: event_type.into(),
            data: json!({}),
            timestamp: ts(timestamp),
        }
    }

    /// Subscriptions register on the server asynchronously; wait until the
    /// membership is visible before publishing.
    async fn wait_for_subscribers(server: &StrandServer, stream_id: &str, count: usize) {
        for _ in 0..200 {
            if server.subscriber_count(stream_id) == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stream {stream_id} never reached {count} subscribers");
    }

    #[tokio::test]
    async fn command_round_trips_end_to_end() {
        let harness = start_relay().await;
        let client = connect_client(&harness).await;

        let result = client
            .send_command(WireCommand {
                id: Uuid::new_v4().to_string(),
                target: "user-123".into(),
                name: "UpdateProfile".into(),
                payload: json!({ "name": "John Doe" }),
            })
            .await
            .unwrap();

        assert_eq!(
            result,
            CommandResult::success(EventStreamPosition::new("user-123", 42))
        );
    }

    #[tokio::test]
    async fn failure_results_reach_the_caller_as_error_strings() {
        let harness = start_relay().await;
        let client = connect_client(&harness).await;

        let result = client
            .send_command(WireCommand {
                id: "cmd-bad".into(),
                target: "user-123".into(),
                name: "UpdateProfile".into(),
                payload: json!({ "name": "" }),
            })
            .await
            .unwrap();

        // The wire flattens the failure to a string; the detailed error
        // still round-trips as JSON inside it.
        let CommandResult::Failure {
            error: CommandError::Unknown { command_id, message },
        } = result
        else {
            panic!("expected failure, got {result:?}");
        };
        assert_eq!(command_id, "cmd-bad");
        let detail: CommandError = serde_json::from_str(&message).unwrap();
        assert!(matches!(detail, CommandError::Validation { .. }));
    }

    #[tokio::test]
    async fn subscribed_client_receives_events_in_order() {
        let harness = start_relay().await;
        let client = connect_client(&harness).await;

        let mut sub = client.subscribe("user-123").await.unwrap();
        wait_for_subscribers(&harness.server, "user-123", 1).await;

        harness
            .server
            .publish_event(event("user-123", 1, "UserCreated", "2024-01-01T10:00:00Z"))
            .await
            .unwrap();
        harness
            .server
            .publish_event(event(
                "user-123",
                2,
                "UserEmailUpdated",
                "2024-01-01T10:01:00Z",
            ))
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_type, "UserCreated");
        assert_eq!(first.position.event_number, 1);
        assert_eq!(first.timestamp, ts("2024-01-01T10:00:00Z"));

        let second = sub.recv().await.unwrap();
        assert_eq!(second.event_type, "UserEmailUpdated");
        assert_eq!(second.position.event_number, 2);
        assert_eq!(second.timestamp, ts("2024-01-01T10:01:00Z"));
    }

    #[tokio::test]
    async fn events_do_not_leak_across_streams() {
        let harness = start_relay().await;
        let client = connect_client(&harness).await;

        let mut sub_a = client.subscribe("stream-a").await.unwrap();
        let mut sub_b = client.subscribe("stream-b").await.unwrap();
        wait_for_subscribers(&harness.server, "stream-a", 1).await;
        wait_for_subscribers(&harness.server, "stream-b", 1).await;

        harness
            .server
            .publish_event(event("stream-a", 1, "AOnly", "2024-01-01T10:00:00Z"))
            .await
            .unwrap();
        harness
            .server
            .publish_event(event("stream-b", 1, "BOnly", "2024-01-01T10:00:00Z"))
            .await
            .unwrap();

        assert_eq!(sub_a.recv().await.unwrap().event_type, "AOnly");
        assert_eq!(sub_b.recv().await.unwrap().event_type, "BOnly");
    }

    #[tokio::test]
    async fn event_ordering_is_preserved_per_stream() {
        let harness = start_relay().await;
        let client = connect_client(&harness).await;

        let mut sub = client.subscribe("user-123").await.unwrap();
        wait_for_subscribers(&harness.server, "user-123", 1).await;

        for n in 1..=5 {
            harness
                .server
                .publish_event(event(
                    "user-123",
                    n,
                    &format!("Event{n}"),
                    "2024-01-01T10:00:00Z",
                ))
                .await
                .unwrap();
        }
        for n in 1..=5 {
            assert_eq!(sub.recv().await.unwrap().position.event_number, n);
        }
    }

    #[tokio::test]
    async fn unsubscribed_stream_publish_is_a_no_op() {
        let harness = start_relay().await;
        let _client = connect_client(&harness).await;

        assert_eq!(harness.server.subscriber_count("nobody-listens"), 0);
        harness
            .server
            .publish_event(event("nobody-listens", 1, "Lost", "2024-01-01T10:00:00Z"))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_handler_times_out_the_client() {
        // No dispatcher: commands pile up unanswered.
        let transport = InMemoryServerTransport::new();
        let _server =
            StrandServer::start(transport.clone() as Arc<dyn ServerTransport>).unwrap();
        let client = StrandClient::connect(transport.connect().await.unwrap())
            .await
            .unwrap();

        let err = client
            .send_command(WireCommand {
                id: "cmd-slow".into(),
                target: "user-123".into(),
                name: "UpdateProfile".into(),
                payload: json!({ "name": "John Doe" }),
            })
            .await
            .unwrap_err();

        let ClientError::CommandTimeout {
            command_id,
            timeout_ms,
        } = err
        else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(command_id, "cmd-slow");
        assert_eq!(timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn disconnect_purges_server_side_subscriptions() {
        let harness = start_relay().await;
        let transport = harness.transport.connect().await.unwrap();
        let client = StrandClient::connect(
            Arc::clone(&transport) as Arc<dyn crate::transport::ClientTransport>
        )
        .await
        .unwrap();

        let _sub = client.subscribe("user-123").await.unwrap();
        wait_for_subscribers(&harness.server, "user-123", 1).await;

        client.close().await;
        wait_for_subscribers(&harness.server, "user-123", 0).await;
    }

    #[tokio::test]
    async fn close_disconnects_clients_and_rejects_new_connections() {
        let harness = start_relay().await;
        let client = connect_client(&harness).await;

        let mut state = client.connection_state();
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        harness.server.close().await;

        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(matches!(
            harness.transport.connect().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn results_broadcast_to_all_but_complete_only_the_sender() {
        let harness = start_relay().await;
        let sender = connect_client(&harness).await;
        let bystander = connect_client(&harness).await;

        let result = sender
            .send_command(WireCommand {
                id: "cmd-1".into(),
                target: "user-123".into(),
                name: "UpdateProfile".into(),
                payload: json!({ "name": "John Doe" }),
            })
            .await
            .unwrap();
        assert!(result.is_success());

        // The bystander saw the broadcast result, discarded it, and stays
        // fully usable.
        let other = bystander
            .send_command(WireCommand {
                id: "cmd-2".into(),
                target: "user-456".into(),
                name: "UpdateProfile".into(),
                payload: json!({ "name": "Jane Doe" }),
            })
            .await
            .unwrap();
        assert_eq!(
            other,
            CommandResult::success(EventStreamPosition::new("user-456", 42))
        );
    }

    #[tokio::test]
    async fn command_stream_is_single_consumer() {
        let transport = InMemoryServerTransport::new();
        let server = StrandServer::start(transport as Arc<dyn ServerTransport>).unwrap();

        let _commands = server.commands().unwrap();
        assert!(matches!(
            server.commands(),
            Err(ServerError::CommandsClaimed)
        ));
    }
}
