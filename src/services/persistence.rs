//! Persistence service — fire-and-forget durable writes.
//!
//! DESIGN
//! ======
//! Broadcast is the fast path; persistence is a best-effort side effect.
//! Handlers enqueue a `PersistJob` with `try_send` and broadcast without
//! waiting. A single worker drains the bounded queue in order, so writes for
//! the same row land in the order they were accepted (a stroke appended
//! before a clear is never resurrected by a late insert).
//!
//! Reaction increments ride the same queue and report the new counts back
//! through a oneshot, so a reaction sent right after a chat message is
//! applied after that message's insert. The visitor counter is read on join
//! only and is awaited against the store directly.
//!
//! ERROR HANDLING
//! ==============
//! Failed writes are retried with linear back-off, then logged and dropped.
//! A crash between broadcast and write loses durability, never delivery.
//! An orderly shutdown drains the queue before the process exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::env_parse;
use crate::db::{Store, StoreError};
use crate::state::{AppState, ChatMessage, ClearMarker, Reactions, Stroke, TypingMarker};

const DEFAULT_PERSIST_QUEUE_CAPACITY: usize = 8192;
const DEFAULT_PERSIST_RETRIES: usize = 2;
const DEFAULT_PERSIST_RETRY_BASE_MS: u64 = 20;

/// Tuning knobs for the persistence worker, loaded from environment variables.
#[derive(Clone, Copy)]
pub(crate) struct PersistConfig {
    /// Bounded channel capacity for the persist queue.
    pub(crate) queue_capacity: usize,
    /// Number of attempts per job on store failures.
    pub(crate) retries: usize,
    /// Base delay in milliseconds for linear retry back-off.
    pub(crate) retry_base_ms: u64,
}

impl PersistConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            queue_capacity: env_parse("PERSIST_QUEUE_CAPACITY", DEFAULT_PERSIST_QUEUE_CAPACITY).max(1),
            retries: env_parse("PERSIST_RETRIES", DEFAULT_PERSIST_RETRIES).max(1),
            retry_base_ms: env_parse("PERSIST_RETRY_BASE_MS", DEFAULT_PERSIST_RETRY_BASE_MS),
        }
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// One durable write accepted by the relay.
#[derive(Debug, Clone)]
pub enum PersistJob {
    ChatMessage(ChatMessage),
    Online { visitor_id: String, username: String, at_ms: i64 },
    Offline { visitor_id: String, at_ms: i64 },
    Typing(TypingMarker),
    TypingCleared { visitor_id: String },
    Stroke(Stroke),
    CanvasCleared(ClearMarker),
}

impl PersistJob {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::ChatMessage(_) => "chat_message",
            Self::Online { .. } => "online",
            Self::Offline { .. } => "offline",
            Self::Typing(_) => "typing",
            Self::TypingCleared { .. } => "typing_cleared",
            Self::Stroke(_) => "stroke",
            Self::CanvasCleared(_) => "canvas_cleared",
        }
    }

    async fn apply(&self, store: &dyn Store) -> Result<(), StoreError> {
        match self {
            Self::ChatMessage(message) => store.insert_chat_message(message).await,
            Self::Online { visitor_id, username, at_ms } => store.set_online(visitor_id, username, *at_ms).await,
            Self::Offline { visitor_id, at_ms } => store.set_offline(visitor_id, *at_ms).await,
            Self::Typing(marker) => store.set_typing(marker).await,
            Self::TypingCleared { visitor_id } => store.remove_typing(visitor_id).await,
            Self::Stroke(stroke) => store.append_stroke(stroke).await,
            Self::CanvasCleared(marker) => store.clear_strokes(marker).await,
        }
    }
}

pub type ReactionResult = Result<Option<Reactions>, StoreError>;

/// Work drained by the persistence worker, strictly in arrival order.
#[derive(Debug)]
pub enum PersistRequest {
    Write(PersistJob),
    /// Atomic reaction increment. The updated map, or `None` for an unknown
    /// message, is sent back on `reply`.
    Reaction { message_id: String, emoji: String, reply: oneshot::Sender<ReactionResult> },
}

impl PersistRequest {
    fn label(&self) -> &'static str {
        match self {
            Self::Write(job) => job.label(),
            Self::Reaction { .. } => "reaction",
        }
    }
}

// =============================================================================
// WORKER
// =============================================================================

/// Owning handle for the spawned worker.
#[derive(Debug)]
pub struct PersistWorker {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl PersistWorker {
    /// Stop accepting work, apply everything already queued, and wait for
    /// the worker to exit.
    pub async fn drain(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "persistence worker panicked");
        }
    }
}

/// Spawn the persistence worker. The worker exits once every sender is
/// dropped, or once `PersistWorker::drain` has flushed the queue.
#[must_use]
pub fn spawn_persistence_worker(store: Arc<dyn Store>) -> (mpsc::Sender<PersistRequest>, PersistWorker) {
    spawn_persistence_worker_with(store, PersistConfig::from_env())
}

pub(crate) fn spawn_persistence_worker_with(
    store: Arc<dyn Store>,
    config: PersistConfig,
) -> (mpsc::Sender<PersistRequest>, PersistWorker) {
    let (tx, mut rx) = mpsc::channel::<PersistRequest>(config.queue_capacity);
    let stop = CancellationToken::new();

    info!(
        queue_capacity = config.queue_capacity,
        retries = config.retries,
        retry_base_ms = config.retry_base_ms,
        "persistence worker configured"
    );

    let worker_stop = stop.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    run_request(store.as_ref(), request, config).await;
                }
                () = worker_stop.cancelled() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(request) = rx.recv().await {
                        run_request(store.as_ref(), request, config).await;
                        drained += 1;
                    }
                    info!(drained, "persistence queue flushed");
                    break;
                }
            }
        }
        info!("persistence worker stopped");
    });

    (tx, PersistWorker { stop, task })
}

/// Best-effort, non-blocking enqueue.
///
/// Uses `try_send` so the broadcast path never waits on the store.
pub fn enqueue(state: &AppState, job: PersistJob) {
    let Some(tx) = &state.persist_tx else {
        return;
    };

    match tx.try_send(PersistRequest::Write(job)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(request)) => {
            warn!(job = request.label(), "persist queue full; dropping write");
        }
        Err(mpsc::error::TrySendError::Closed(request)) => {
            warn!(job = request.label(), "persist queue closed; dropping write");
        }
    }
}

/// Increment a reaction behind every write queued before it.
///
/// Waits for queue space rather than dropping, so only the reacting session
/// is slowed by a backlog. Without a running worker the store is called
/// directly.
///
/// # Errors
///
/// Returns the store error after retries are exhausted.
pub async fn increment_reaction(state: &AppState, message_id: &str, emoji: &str) -> ReactionResult {
    if let Some(tx) = &state.persist_tx {
        let (reply, result) = oneshot::channel();
        let request = PersistRequest::Reaction { message_id: message_id.to_string(), emoji: emoji.to_string(), reply };
        if tx.send(request).await.is_ok() {
            if let Ok(result) = result.await {
                return result;
            }
        }
        debug!(%message_id, "persist queue unavailable; incrementing reaction directly");
    }
    state.store.increment_reaction(message_id, emoji).await
}

async fn run_request(store: &dyn Store, request: PersistRequest, config: PersistConfig) {
    match request {
        PersistRequest::Write(job) => {
            // Failures are logged inside; the write is dropped.
            let _ = with_retry(job.label(), config, || job.apply(store)).await;
        }
        PersistRequest::Reaction { message_id, emoji, reply } => {
            let result = with_retry("reaction", config, || store.increment_reaction(&message_id, &emoji)).await;
            if reply.send(result).is_err() {
                debug!(%message_id, "reaction requester went away");
            }
        }
    }
}

async fn with_retry<T, F, Fut>(label: &'static str, config: PersistConfig, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.retries => {
                warn!(error = %e, job = label, attempt, total = config.retries, "persist failed; retrying");
                tokio::time::sleep(Duration::from_millis((attempt as u64) * config.retry_base_ms)).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(error = %e, job = label, "persist failed after retries; dropping write");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
