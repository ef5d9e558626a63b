//! Real-time gateway for Tandem.
//!
//! Serves the session protocol over WebSocket (`GET /ws?token=…`) and a
//! `GET /health` probe. Each socket drives one [`Connection`]; all shared
//! services live in a [`ServerContext`] built once at startup.
//!
//! Built on Axum.

pub mod connection;
pub mod context;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod ws;

pub use connection::{Connection, Liveness};
pub use context::ServerContext;
pub use protocol::{ClientMessage, Outbound, ProtocolError, ServerMessage};
pub use registry::ConnectionRegistry;
pub use state::{ConnectionId, ConnectionState, ProtocolState};

use std::sync::Arc;

use axum::{Router, extract::State, response::Json, routing::get};
use serde::Serialize;
use tandem_agent::GenerationGateway;
use tandem_core::EventBus;
use tandem_store::SqliteStore;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

/// Build the Axum router with all gateway routes.
pub fn build_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Start the gateway server.
///
/// Opens the database, resolves the default provider, and serves until the
/// listener fails.
pub async fn start(config: tandem_config::AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let store = Arc::new(SqliteStore::open_file(&config.database_path()).await?);

    let providers = tandem_providers::build_from_config(&config);
    let provider = providers.default().ok_or_else(|| {
        format!(
            "Provider '{}' is not configured; set an API key",
            config.default_provider
        )
    })?;
    let generation = Arc::new(GenerationGateway::from_config(provider, &config));

    let events = Arc::new(EventBus::default());
    spawn_event_logger(&events);

    let ctx = Arc::new(ServerContext::from_store(
        store,
        generation.clone(),
        events,
        &config,
    ));
    let app = build_router(ctx);

    info!(
        addr = %addr,
        provider = generation.provider_name(),
        model = generation.model(),
        "Gateway starting"
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Log every domain event at debug level.
fn spawn_event_logger(events: &EventBus) {
    let mut stream = BroadcastStream::new(events.subscribe());
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => debug!(event = event.name(), "Domain event"),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged");
                }
            }
        }
    });
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
}

async fn health_handler(State(ctx): State<Arc<ServerContext>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: ctx.registry.len(),
    })
}
