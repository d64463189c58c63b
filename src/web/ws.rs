//! WebSocket handler: bridges one socket onto the session registry.
//!
//! Outbound registry events are serialized to JSON text frames; inbound
//! text frames are parsed as client events and dispatched. A frame that
//! fails to parse is dropped, never fatal.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ClientEvent;
use crate::relay::Registry;

/// Handle a single WebSocket connection.
pub async fn handle_ws(socket: WebSocket, registry: Registry) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = registry.register(tx).await;

    loop {
        tokio::select! {
            // Forward registry events to the client
            event = rx.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(conn = %conn, error = %e, "Failed to encode event"),
                }
            }
            // Dispatch inbound client frames
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => registry.handle_event(conn, event).await,
                            Err(e) => {
                                debug!(conn = %conn, error = %e, "Dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // Binary frames are not part of the protocol
                }
            }
        }
    }

    registry.disconnect(conn).await;
    debug!(conn = %conn, "WebSocket client disconnected");
}
