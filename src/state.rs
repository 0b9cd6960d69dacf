//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! cloned into every connection task. Each shared structure sits behind its
//! own lock inside its owning service (session map, online-set, typing-set,
//! canvas log), so no handler ever holds a raw shared container. The durable
//! store is reached through the `Store` trait and, for fire-and-forget writes,
//! through the bounded persistence queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RelayConfig;
use crate::db::Store;
use crate::services::canvas::CanvasState;
use crate::services::moderation::ModerationGate;
use crate::services::persistence::{self, PersistRequest, PersistWorker};
use crate::services::presence::{self, PresenceTracker};
use crate::services::session::SessionRegistry;

// =============================================================================
// RECORDS
// =============================================================================

/// Emoji → count. Ordered so broadcasts are stable.
pub type Reactions = BTreeMap<String, i64>;

/// A chat line. Mirrors the `chat_messages` table and the `chat:message` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    /// Display name of the sender at send time.
    pub user: String,
    pub text: String,
    pub color: String,
    /// Milliseconds since Unix epoch.
    pub time: i64,
    /// Sender's visitor identity.
    pub uid: String,
    pub avatar: String,
    pub avatar_image: Option<String>,
    #[serde(default)]
    pub reactions: Reactions,
}

/// One visitor's presence row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub visitor_id: String,
    pub username: String,
    pub online: bool,
    /// Set when the visitor went offline.
    pub last_seen: Option<i64>,
}

/// "Visitor is typing" marker. Superseded by newer markers for the same visitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingMarker {
    pub visitor_id: String,
    pub username: String,
    pub ts: i64,
}

/// A canvas stroke. The payload is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub id: String,
    pub stroke_data: serde_json::Value,
}

/// Written when the canvas is wiped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearMarker {
    pub cleared_by: String,
    pub cleared_at: i64,
    /// Monotonic clear counter, carried across restarts by the store.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    pub visitor_id: String,
    pub reason: Option<String>,
    /// `None` is permanent.
    pub expires_at: Option<i64>,
}

impl BanRecord {
    /// Active when permanent or expiring in the future.
    #[must_use]
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.expires_at.is_none_or(|expires| expires > now_ms)
    }
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<RelayConfig>,
    pub sessions: SessionRegistry,
    pub presence: PresenceTracker,
    pub canvas: CanvasState,
    pub moderation: ModerationGate,
    /// Bounded queue feeding the persistence worker. `None` disables
    /// fire-and-forget writes.
    pub persist_tx: Option<mpsc::Sender<PersistRequest>>,
    /// Taken by `stop` to flush the queue.
    persist_worker: Arc<tokio::sync::Mutex<Option<PersistWorker>>>,
    /// Cancelled on process shutdown; ends every connection and stops the
    /// presence timers.
    pub shutdown: CancellationToken,
    /// Upgraded WebSocket tasks, which run outside the HTTP server's own
    /// connection tracking.
    pub connections: TaskTracker,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: RelayConfig) -> Self {
        let presence = PresenceTracker::new(&config);
        Self {
            moderation: ModerationGate::new(store.clone()),
            store,
            config: Arc::new(config),
            sessions: SessionRegistry::new(),
            presence,
            canvas: CanvasState::new(),
            persist_tx: None,
            persist_worker: Arc::default(),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Spawn the persistence worker and route fire-and-forget writes to it.
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn with_persistence_worker(mut self) -> Self {
        let (tx, worker) = persistence::spawn_persistence_worker(self.store.clone());
        self.persist_tx = Some(tx);
        self.persist_worker = Arc::new(tokio::sync::Mutex::new(Some(worker)));
        self
    }

    /// Orderly stop: end every connection so each runs its part sequence,
    /// stop the presence timers, then flush queued writes.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.connections.close();
        self.connections.wait().await;
        presence::stop_timers(self).await;

        let worker = self.persist_worker.lock().await.take();
        if let Some(worker) = worker {
            worker.drain().await;
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
