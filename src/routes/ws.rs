//! WebSocket handler — one relay session per connection.
//!
//! DESIGN
//! ======
//! On upgrade the connection joins the session registry and enters a
//! `select!` loop:
//! - incoming text frames → `router::dispatch_text`, one at a time
//! - queued outbound events for this session → encode and send
//!
//! Inbound events from one connection are therefore handled strictly in
//! order, and everything sent to the connection flows through its single
//! bounded queue.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → `session::join` (snapshot, online, timers)
//! 2. Client sends frames → router
//! 3. Close, transport error or server shutdown → `session::part`
//!
//! Connection tasks are registered with `AppState::connections` so an
//! orderly stop can wait for every part sequence to finish.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::ServerEvent;
use crate::services::{router, session};
use crate::state::{AppState, now_ms};

pub const ANONYMOUS: &str = "Anonymous";
const VISITOR_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Identity claimed by the client in the upgrade query string. Neither field
/// is verified.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl HandshakeParams {
    /// The claimed visitor id, or a freshly generated one.
    #[must_use]
    pub fn resolve_visitor_id(&self) -> String {
        match self.visitor_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generate_visitor_id(),
        }
    }

    #[must_use]
    pub fn resolve_username(&self) -> String {
        match self.username.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => ANONYMOUS.to_string(),
        }
    }
}

/// `visitor_<epoch ms>_<9 base36 chars>`.
#[must_use]
pub fn generate_visitor_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..VISITOR_SUFFIX_LEN)
        .map(|_| char::from(BASE36[rng.random_range(0..BASE36.len())]))
        .collect();
    format!("visitor_{}_{suffix}", now_ms())
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let connections = state.connections.clone();
    ws.on_upgrade(move |socket| connections.track_future(run_ws(socket, state, params)))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, params: HandshakeParams) {
    let (client_tx, mut client_rx) = mpsc::channel::<ServerEvent>(state.config.client_queue_capacity);
    let ctx = session::join(&state, client_tx, params.resolve_visitor_id(), params.resolve_username()).await;

    info!(session_id = %ctx.session_id, visitor_id = %ctx.visitor_id, "ws: client connected");

    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => {
                debug!(session_id = %ctx.session_id, "ws: server shutting down");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(session_id = %ctx.session_id, error = %e, "ws: receive failed");
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => router::dispatch_text(&state, &ctx, text.as_str()).await,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = client_rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    session::part(&state, ctx.session_id).await;
    info!(session_id = %ctx.session_id, "ws: client disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match event.encode() {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, event = event.name(), "ws: failed to serialize event");
            return Ok(());
        }
    };
    if !event.is_cursor() {
        debug!(event = event.name(), "ws: send event");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
