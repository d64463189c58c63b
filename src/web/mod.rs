//! Web server module: axum HTTP + WebSocket access to the relay.
//!
//! Provides:
//! - `GET /api/status` - relay status
//! - `WS /ws` - session event stream (JSON text frames)

pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::relay::Registry;

/// Shared state for the web server
struct WebState {
    registry: Registry,
    start_time: Instant,
}

/// Build the relay router. Split out from [`serve`] so tests can drive
/// it without binding a socket.
pub fn app(registry: Registry) -> Router {
    let state = Arc::new(WebState {
        registry,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/status", get(api_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the relay web server.
pub async fn serve(registry: Registry, bind: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("Failed to bind to {}", bind))?;

    info!("Relay listening on http://{}", bind);

    axum::serve(listener, app(registry))
        .await
        .context("Web server error")?;

    Ok(())
}

/// WebSocket upgrade handler
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WebState>>,
) -> impl IntoResponse {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| ws::handle_ws(socket, registry))
}

/// GET /api/status - relay status
async fn api_status(State(state): State<Arc<WebState>>) -> Json<serde_json::Value> {
    let stats = state.registry.stats().await;
    let uptime = state.start_time.elapsed().as_secs();

    Json(serde_json::json!({
        "connections": stats.connections,
        "sessions_active": stats.sessions_active,
        "sessions_created": stats.sessions_created,
        "events_forwarded": stats.events_forwarded,
        "events_dropped": stats.events_dropped,
        "uptime_secs": uptime,
    }))
}
