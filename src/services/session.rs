//! Session registry — live connections and their join/part lifecycle.
//!
//! ARCHITECTURE
//! ============
//! Each WebSocket connection becomes one `Session` keyed by a server-minted
//! `SessionId`. Visitor identities are self-asserted and may repeat: two tabs
//! of the same visitor are two sessions, and both are found by
//! `find_by_visitor`. The registry also owns outbound delivery, since the
//! per-session senders live in its map.
//!
//! LIFECYCLE
//! =========
//! 1. `join` → register, count the visit once, send the snapshot, go online
//! 2. router handles inbound events for the session
//! 3. `part` → unregister, go offline, drop typing and relayed cursors
//!
//! TRADE-OFFS
//! ==========
//! Online/offline is keyed by visitor, not by session. Closing one of two
//! tabs marks the visitor offline until the next resync re-derives presence
//! from the sessions still registered. This flapping is accepted.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::ServerEvent;
use crate::services::{persistence, presence};
use crate::services::persistence::PersistJob;
use crate::state::{AppState, now_ms};

pub type SessionId = Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// One live connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Immutable for the session's lifetime.
    pub visitor_id: String,
    pub username: String,
    pub joined_at: i64,
    tx: mpsc::Sender<ServerEvent>,
    /// Set once the visitor counter has been bumped for this connection.
    visitor_counted: bool,
}

impl Session {
    /// Queue an event for this session without waiting. A full queue drops
    /// the event for this session only.
    fn deliver(&self, event: &ServerEvent) -> bool {
        match self.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %self.id, event = event.name(), "session queue full; dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = %self.id, event = event.name(), "session queue closed");
                false
            }
        }
    }
}

/// Identity the router needs for every inbound event of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub visitor_id: String,
    pub username: String,
}

/// Who receives an outbound event.
#[derive(Debug, Clone, Copy)]
pub enum Fanout<'a> {
    All,
    AllExcept(SessionId),
    Session(SessionId),
    /// Every session of a visitor; zero if the visitor is not connected.
    Visitor(&'a str),
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Duplicate visitor identities are allowed.
    pub async fn register(&self, tx: mpsc::Sender<ServerEvent>, visitor_id: String, username: String) -> SessionId {
        let id = Uuid::new_v4();
        let session = Session { id, visitor_id, username, joined_at: now_ms(), tx, visitor_counted: false };
        self.sessions.write().await.insert(id, session);
        id
    }

    pub async fn unregister(&self, id: SessionId) -> Option<Session> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn lookup(&self, id: SessionId) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn find_by_visitor(&self, visitor_id: &str) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.visitor_id == visitor_id)
            .cloned()
            .collect()
    }

    /// `(visitor_id, username)` of every live session, one entry per session.
    pub async fn visitors(&self) -> Vec<(String, String)> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| (s.visitor_id.clone(), s.username.clone()))
            .collect()
    }

    /// Flip the per-connection visit flag. Returns true only the first time.
    pub async fn mark_visitor_counted(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&id) else {
            return false;
        };
        if session.visitor_counted {
            return false;
        }
        session.visitor_counted = true;
        true
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Queue `event` for every session selected by `fanout`. Returns how many
    /// sessions accepted it.
    pub async fn deliver(&self, event: &ServerEvent, fanout: Fanout<'_>) -> usize {
        let sessions = self.sessions.read().await;
        match fanout {
            Fanout::Session(id) => sessions.get(&id).map_or(0, |s| usize::from(s.deliver(event))),
            Fanout::All => sessions.values().filter(|s| s.deliver(event)).count(),
            Fanout::AllExcept(excluded) => sessions
                .values()
                .filter(|s| s.id != excluded)
                .filter(|s| s.deliver(event))
                .count(),
            Fanout::Visitor(visitor_id) => sessions
                .values()
                .filter(|s| s.visitor_id == visitor_id)
                .filter(|s| s.deliver(event))
                .count(),
        }
    }
}

// =============================================================================
// JOIN / PART
// =============================================================================

/// Register a new connection and bring it up to date.
///
/// The snapshot is sent to the joining session only and is taken before the
/// visitor is marked online; everyone (the joiner included) then receives the
/// updated online list.
pub async fn join(state: &AppState, tx: mpsc::Sender<ServerEvent>, visitor_id: String, username: String) -> SessionContext {
    let session_id = state.sessions.register(tx, visitor_id.clone(), username.clone()).await;
    let ctx = SessionContext { session_id, visitor_id, username };

    let total_visitors = if state.sessions.mark_visitor_counted(session_id).await {
        match state.store.increment_visitor_total().await {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, %session_id, "visitor counter increment failed");
                state.store.visitor_total().await.unwrap_or(0)
            }
        }
    } else {
        state.store.visitor_total().await.unwrap_or(0)
    };

    send_snapshot(state, &ctx, total_visitors).await;

    let now = now_ms();
    state.presence.set_online(&ctx.visitor_id, &ctx.username);
    persistence::enqueue(
        state,
        PersistJob::Online { visitor_id: ctx.visitor_id.clone(), username: ctx.username.clone(), at_ms: now },
    );
    state
        .sessions
        .deliver(&ServerEvent::VisitorsOnline(state.presence.snapshot()), Fanout::All)
        .await;

    presence::ensure_timers(state).await;

    let sessions = state.sessions.len().await;
    info!(
        session_id = %ctx.session_id,
        visitor_id = %ctx.visitor_id,
        sessions,
        "session joined"
    );
    ctx
}

async fn send_snapshot(state: &AppState, ctx: &SessionContext, total_visitors: i64) {
    let messages = match state.store.recent_chat_messages(state.config.recent_chat_limit).await {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, session_id = %ctx.session_id, "recent chat load failed; sending empty history");
            Vec::new()
        }
    };

    let snapshot = [
        ServerEvent::ChatInitial(messages),
        ServerEvent::VisitorsOnline(state.presence.snapshot()),
        ServerEvent::VisitorsTotal { total_visitors },
        ServerEvent::ChatTyping(state.presence.typing_view(now_ms())),
        ServerEvent::CanvasInitial(state.canvas.list_strokes()),
    ];
    for event in &snapshot {
        state.sessions.deliver(event, Fanout::Session(ctx.session_id)).await;
    }
}

/// Tear down a closed connection and tell the remaining sessions.
pub async fn part(state: &AppState, session_id: SessionId) {
    let Some(session) = state.sessions.unregister(session_id).await else {
        return;
    };

    let now = now_ms();
    state.presence.set_offline(&session.visitor_id, now);
    persistence::enqueue(state, PersistJob::Offline { visitor_id: session.visitor_id.clone(), at_ms: now });

    presence::drop_typing(state, &session.visitor_id);
    state.sessions.deliver(&presence::typing_event(state), Fanout::All).await;

    for user_id in state.canvas.take_cursors(session_id) {
        state
            .sessions
            .deliver(&ServerEvent::CanvasCursorRemove { user_id }, Fanout::All)
            .await;
    }

    state
        .sessions
        .deliver(&ServerEvent::VisitorsOnline(state.presence.snapshot()), Fanout::All)
        .await;

    let remaining = state.sessions.len().await;
    info!(
        %session_id,
        visitor_id = %session.visitor_id,
        remaining,
        "session parted"
    );
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
