//! strandd — standalone strand relay server.
//!
//! Serves the WebSocket transport with a small demo registry: clients can
//! send `UpdateProfile` commands and subscribe to the per-target event
//! streams the dispatch loop appends to.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use strand::config::Config;
use strand::registry::{CommandPayload, CommandRegistry};
use strand::server::StrandServer;
use strand::types::{CommandResult, DomainCommand, Event, EventStreamPosition};
use strand::ws::{self, WsServerTransport};
use strand::ServerTransport;

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

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = Config::from_env();

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    info!("strandd starting");

    // ── Transport + protocol ────────────────────────────────
    let transport = WsServerTransport::new();
    let server = StrandServer::start(transport.clone() as Arc<dyn ServerTransport>)
        .expect("fresh transport");

    let registry = Arc::new(
        CommandRegistry::builder()
            .define(
                "UpdateProfile",
                |cmd: DomainCommand<UpdateProfile>| async move {
                    CommandResult::success(EventStreamPosition::new(cmd.target, 1))
                },
            )
            .build()
            .expect("demo command names are unique"),
    );

    // ── Dispatch loop ───────────────────────────────────────
    // Like `run_dispatcher`, but successful commands also append an event
    // to the target's stream for subscribers to observe.
    let dispatch_server = Arc::clone(&server);
    tokio::spawn(async move {
        let mut commands = match dispatch_server.commands() {
            Ok(commands) => commands,
            Err(err) => {
                error!("could not claim command stream: {err}");
                return;
            }
        };
        while let Some(command) = commands.next().await {
            info!(command_id = %command.id, name = %command.name, "dispatching");
            let command_id = command.id.clone();
            let payload = command.payload.clone();
            let result = registry.dispatch(command).await;

            if let CommandResult::Success { position } = &result {
                let event = Event {
                    position: position.clone(),
                    event_type: "ProfileUpdated".into(),
                    data: json!({ "payload": payload }),
                    timestamp: Utc::now(),
                };
                if let Err(err) = dispatch_server.publish_event(event).await {
                    error!(command_id = %command_id, "publish_event error: {err}");
                }
            }
            if let Err(err) = dispatch_server.send_result(&command_id, result).await {
                error!(command_id = %command_id, "send_result error: {err}");
            }
        }
    });

    // ── Routes ──────────────────────────────────────────────
    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(transport);

    // ── Bind & serve ────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "strandd listening");

    axum::serve(listener, app).await.expect("server error");
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}
