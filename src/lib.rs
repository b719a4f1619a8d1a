//! strand — command dispatch and event-stream relay over pluggable message
//! transports.
//!
//! Three subsystems cooperate:
//!
//! - the [`registry`]: named command definitions with schema validation,
//!   dispatching wire commands to typed handlers and reifying every failure
//!   into a [`CommandResult`](types::CommandResult);
//! - the [`client`] protocol: correlated request/response with a fixed
//!   10-second deadline, plus per-stream event subscriptions;
//! - the [`server`] protocol: fan-in of inbound command streams, fan-out of
//!   event broadcasts, per-client subscription bookkeeping.
//!
//! They meet at the [`transport`] contract; [`memory`] is the in-process
//! reference implementation and [`ws`] carries the same protocol over
//! WebSocket.
//!
//! ```ignore
//! let transport = InMemoryServerTransport::new();
//! let server = StrandServer::start(transport.clone())?;
//! tokio::spawn(run_dispatcher(Arc::clone(&server), registry));
//!
//! let client = StrandClient::connect(transport.connect().await?).await?;
//! let result = client.send_command(command).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod registry;
pub mod server;
pub mod transport;
pub mod types;
pub mod ws;

pub use client::{StrandClient, Subscription, COMMAND_TIMEOUT};
pub use error::{ClientError, RegistryError, ServerError, TransportError};
pub use memory::{InMemoryClientTransport, InMemoryServerTransport};
pub use registry::{CommandPayload, CommandRegistry, CommandRegistryBuilder};
pub use server::{run_dispatcher, CommandStream, StrandServer};
pub use transport::{
    ClientConnection, ClientId, ClientTransport, ConnectionState, ConnectionStream,
    MessageFilter, MessageStream, ServerTransport, TransportMessage,
};
pub use types::{
    CommandError, CommandResult, DomainCommand, Event, EventStreamPosition, WireCommand,
};
