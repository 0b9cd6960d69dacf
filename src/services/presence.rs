//! Presence tracker — online-set, typing-set and the two presence timers.
//!
//! DESIGN
//! ======
//! The online-set and the typing-set each sit behind their own mutex and
//! are the authoritative views; every mutation is mirrored to the store
//! through the persistence queue by the caller.
//!
//! Typing has two independent expiry mechanisms: `typing_view` hides markers
//! older than the short TTL at read time, and the cleanup sweep deletes
//! markers older than the longer retention window.
//!
//! TIMERS
//! ======
//! - resync (seconds): re-derives online state from live sessions, then
//!   re-broadcasts the online list, visitor total and typing view to every
//!   session whether or not anything changed. Heals missed events.
//! - cleanup: sweeps stale typing markers and long-offline presence records,
//!   and refreshes the cached profanity list.
//!
//! Both start with the first session and stop when the shutdown token is
//! cancelled.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::event::ServerEvent;
use crate::services::persistence::{self, PersistJob};
use crate::services::session::Fanout;
use crate::state::{AppState, PresenceRecord, TypingMarker, now_ms};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// TRACKER
// =============================================================================

#[derive(Clone)]
pub struct PresenceTracker {
    online: Arc<Mutex<BTreeMap<String, PresenceRecord>>>,
    typing: Arc<Mutex<HashMap<String, TypingMarker>>>,
    timers: Arc<tokio::sync::Mutex<Option<PresenceTimers>>>,
    typing_ttl_ms: i64,
    typing_retention_ms: i64,
    presence_retention_ms: i64,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            online: Arc::default(),
            typing: Arc::default(),
            timers: Arc::default(),
            typing_ttl_ms: config.typing_ttl_ms,
            typing_retention_ms: config.typing_retention_ms,
            presence_retention_ms: config.presence_retention_ms,
        }
    }

    /// Last write wins: any session of the visitor may flip it online.
    pub fn set_online(&self, visitor_id: &str, username: &str) {
        lock(&self.online).insert(
            visitor_id.to_string(),
            PresenceRecord { visitor_id: visitor_id.to_string(), username: username.to_string(), online: true, last_seen: None },
        );
    }

    /// Last write wins: closing any session of the visitor flips it offline.
    pub fn set_offline(&self, visitor_id: &str, now: i64) {
        if let Some(record) = lock(&self.online).get_mut(visitor_id) {
            record.online = false;
            record.last_seen = Some(now);
        }
    }

    /// Online visitors ordered by visitor id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        lock(&self.online)
            .values()
            .filter(|r| r.online)
            .cloned()
            .collect()
    }

    /// The stored record for a visitor, online or not.
    #[must_use]
    pub fn record(&self, visitor_id: &str) -> Option<PresenceRecord> {
        lock(&self.online).get(visitor_id).cloned()
    }

    /// Mark every visitor with a live session online again. Returns the
    /// visitors that were not online before.
    pub fn rederive(&self, live: &[(String, String)]) -> Vec<(String, String)> {
        let mut online = lock(&self.online);
        let mut restored = Vec::new();
        for (visitor_id, username) in live {
            if online.get(visitor_id).is_some_and(|r| r.online) {
                continue;
            }
            online.insert(
                visitor_id.clone(),
                PresenceRecord { visitor_id: visitor_id.clone(), username: username.clone(), online: true, last_seen: None },
            );
            restored.push((visitor_id.clone(), username.clone()));
        }
        if !restored.is_empty() {
            debug!(count = restored.len(), "presence re-derived from live sessions");
        }
        restored
    }

    /// Drop offline records last seen before the retention window.
    pub fn purge_offline(&self, now: i64) -> usize {
        let cutoff = now - self.presence_retention_ms;
        let mut online = lock(&self.online);
        let before = online.len();
        online.retain(|_, r| r.online || r.last_seen.is_none_or(|seen| seen >= cutoff));
        before - online.len()
    }

    // --- typing ---

    /// Replace the visitor's typing marker.
    pub fn set_typing(&self, visitor_id: &str, username: &str, now: i64) -> TypingMarker {
        let marker = TypingMarker { visitor_id: visitor_id.to_string(), username: username.to_string(), ts: now };
        lock(&self.typing).insert(visitor_id.to_string(), marker.clone());
        marker
    }

    pub fn clear_typing(&self, visitor_id: &str) -> bool {
        lock(&self.typing).remove(visitor_id).is_some()
    }

    /// Names of visitors typing within the TTL, oldest marker first. Expired
    /// markers are excluded even if the sweep has not deleted them yet.
    #[must_use]
    pub fn typing_view(&self, now: i64) -> Vec<String> {
        let cutoff = now - self.typing_ttl_ms;
        let typing = lock(&self.typing);
        let mut live: Vec<&TypingMarker> = typing.values().filter(|m| m.ts > cutoff).collect();
        live.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.visitor_id.cmp(&b.visitor_id)));
        live.into_iter().map(|m| m.username.clone()).collect()
    }

    /// Delete markers older than the retention window.
    pub fn sweep_typing(&self, now: i64) -> usize {
        let cutoff = now - self.typing_retention_ms;
        let mut typing = lock(&self.typing);
        let before = typing.len();
        typing.retain(|_, m| m.ts >= cutoff);
        before - typing.len()
    }

    /// Markers currently held, expired or not.
    #[must_use]
    pub fn typing_markers(&self) -> usize {
        lock(&self.typing).len()
    }
}

// =============================================================================
// TYPING EVENTS
// =============================================================================

/// Record a typing marker and mirror it to the store.
pub fn record_typing(state: &AppState, visitor_id: &str, username: &str) {
    let marker = state.presence.set_typing(visitor_id, username, now_ms());
    persistence::enqueue(state, PersistJob::Typing(marker));
}

/// Drop a typing marker and mirror the removal.
pub fn drop_typing(state: &AppState, visitor_id: &str) {
    state.presence.clear_typing(visitor_id);
    persistence::enqueue(state, PersistJob::TypingCleared { visitor_id: visitor_id.to_string() });
}

/// The current typing view as an outbound event.
#[must_use]
pub fn typing_event(state: &AppState) -> ServerEvent {
    ServerEvent::ChatTyping(state.presence.typing_view(now_ms()))
}

async fn broadcast_typing(state: &AppState, now: i64) {
    state
        .sessions
        .deliver(&ServerEvent::ChatTyping(state.presence.typing_view(now)), Fanout::All)
        .await;
}

// =============================================================================
// TIMERS
// =============================================================================

pub struct PresenceTimers {
    resync: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

/// Start the resync and cleanup timers unless they are already running.
pub async fn ensure_timers(state: &AppState) {
    let mut timers = state.presence.timers.lock().await;
    if timers.is_some() || state.shutdown.is_cancelled() {
        return;
    }
    *timers = Some(PresenceTimers {
        resync: spawn_periodic(state.clone(), state.config.resync_interval, "resync", |s| async move {
            resync_tick(&s).await;
        }),
        cleanup: spawn_periodic(state.clone(), state.config.cleanup_interval, "cleanup", |s| async move {
            cleanup_tick(&s).await;
        }),
    });
    info!(
        resync_ms = state.config.resync_interval.as_millis(),
        cleanup_ms = state.config.cleanup_interval.as_millis(),
        "presence timers started"
    );
}

/// Cancel the timers and wait for them to exit.
pub async fn stop_timers(state: &AppState) {
    state.shutdown.cancel();
    let Some(timers) = state.presence.timers.lock().await.take() else {
        return;
    };
    for (name, handle) in [("resync", timers.resync), ("cleanup", timers.cleanup)] {
        if let Err(e) = handle.await {
            warn!(error = %e, timer = name, "presence timer ended abnormally");
        }
    }
    info!("presence timers stopped");
}

fn spawn_periodic<F, Fut>(state: AppState, period: Duration, name: &'static str, tick: F) -> JoinHandle<()>
where
    F: Fn(AppState) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let token: CancellationToken = state.shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the join path already sent a snapshot.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => tick(state.clone()).await,
            }
        }
        debug!(timer = name, "presence timer exiting");
    })
}

/// Heartbeat: re-derive online state and re-broadcast the full views.
pub async fn resync_tick(state: &AppState) {
    let now = now_ms();
    let live = state.sessions.visitors().await;
    for (visitor_id, username) in state.presence.rederive(&live) {
        persistence::enqueue(state, PersistJob::Online { visitor_id, username, at_ms: now });
    }

    state
        .sessions
        .deliver(&ServerEvent::VisitorsOnline(state.presence.snapshot()), Fanout::All)
        .await;

    match state.store.visitor_total().await {
        Ok(total_visitors) => {
            state
                .sessions
                .deliver(&ServerEvent::VisitorsTotal { total_visitors }, Fanout::All)
                .await;
        }
        Err(e) => warn!(error = %e, "visitor total read failed; skipping total resync"),
    }

    broadcast_typing(state, now).await;
}

/// Sweep stale typing markers and offline presence, in memory and in the store.
pub async fn cleanup_tick(state: &AppState) {
    let now = now_ms();

    let swept = state.presence.sweep_typing(now);
    if let Err(e) = state.store.purge_typing(now - state.config.typing_retention_ms).await {
        warn!(error = %e, "typing purge failed");
    }

    let purged = state.presence.purge_offline(now);
    if let Err(e) = state.store.purge_offline(now - state.config.presence_retention_ms).await {
        warn!(error = %e, "presence purge failed");
    }

    if let Err(e) = state.moderation.refresh_profanity().await {
        warn!(error = %e, "profanity list refresh failed; keeping cached list");
    }

    if swept > 0 || purged > 0 {
        debug!(swept, purged, "presence cleanup");
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
