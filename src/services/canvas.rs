//! Canvas state — the shared stroke log and relayed cursors.
//!
//! DESIGN
//! ======
//! The in-memory log is authoritative for `canvas:initial`. It is hydrated
//! from the store at startup; afterwards every append and clear is applied
//! here first and mirrored through the ordered persistence queue, so a
//! stroke accepted before a clear can never reappear after it.
//!
//! Strokes are append-only. A stroke that reuses an id replaces the earlier
//! payload in place and keeps its position. Single-stroke removal is not
//! supported; `remove_stroke` reports that explicitly.
//!
//! Cursor positions are relayed, not stored. The log only remembers which
//! cursor user ids each session has relayed so they can be removed for
//! everyone when the session closes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::db::StoreError;
use crate::services::session::SessionId;
use crate::state::{AppState, ClearMarker, Stroke};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CanvasError {
    #[error("removing a single stroke is not supported: {0}")]
    Unsupported(String),
}

#[derive(Default)]
struct StrokeLog {
    strokes: Vec<Stroke>,
    generation: u64,
    last_clear: Option<ClearMarker>,
}

#[derive(Clone, Default)]
pub struct CanvasState {
    log: Arc<Mutex<StrokeLog>>,
    cursors: Arc<Mutex<HashMap<SessionId, BTreeSet<String>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CanvasState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the log with persisted strokes. The generation continues from
    /// the last persisted clear.
    pub fn hydrate(&self, strokes: Vec<Stroke>, last_clear: Option<ClearMarker>) {
        let mut log = lock(&self.log);
        log.generation = last_clear.as_ref().map_or(0, |c| c.generation);
        log.last_clear = last_clear;
        log.strokes = strokes;
    }

    /// Append a stroke, or replace the payload of an existing id. Returns
    /// true when the stroke is new.
    pub fn append_stroke(&self, stroke: Stroke) -> bool {
        let mut log = lock(&self.log);
        if let Some(existing) = log.strokes.iter_mut().find(|s| s.id == stroke.id) {
            existing.stroke_data = stroke.stroke_data;
            return false;
        }
        log.strokes.push(stroke);
        true
    }

    /// Empty the log and bump the generation.
    pub fn clear(&self, cleared_by: &str, cleared_at: i64) -> ClearMarker {
        let mut log = lock(&self.log);
        log.strokes.clear();
        log.generation += 1;
        let marker = ClearMarker { cleared_by: cleared_by.to_string(), cleared_at, generation: log.generation };
        log.last_clear = Some(marker.clone());
        marker
    }

    /// Strokes in arrival order.
    #[must_use]
    pub fn list_strokes(&self) -> Vec<Stroke> {
        lock(&self.log).strokes.clone()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        lock(&self.log).generation
    }

    #[must_use]
    pub fn last_clear(&self) -> Option<ClearMarker> {
        lock(&self.log).last_clear.clone()
    }

    /// # Errors
    ///
    /// Always returns `CanvasError::Unsupported`; the log is left untouched.
    pub fn remove_stroke(&self, stroke_id: &str) -> Result<(), CanvasError> {
        Err(CanvasError::Unsupported(stroke_id.to_string()))
    }

    // --- cursors ---

    pub fn track_cursor(&self, session_id: SessionId, user_id: &str) {
        lock(&self.cursors).entry(session_id).or_default().insert(user_id.to_string());
    }

    pub fn forget_cursor(&self, session_id: SessionId, user_id: &str) -> bool {
        let mut cursors = lock(&self.cursors);
        let Some(ids) = cursors.get_mut(&session_id) else {
            return false;
        };
        let removed = ids.remove(user_id);
        if ids.is_empty() {
            cursors.remove(&session_id);
        }
        removed
    }

    /// Remove and return every cursor id the session relayed.
    pub fn take_cursors(&self, session_id: SessionId) -> Vec<String> {
        lock(&self.cursors)
            .remove(&session_id)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }
}

/// Load the persisted stroke log into memory. Called once at startup.
///
/// # Errors
///
/// Returns the store error if strokes or the clear marker cannot be read.
pub async fn hydrate(state: &AppState) -> Result<usize, StoreError> {
    let strokes = state.store.list_strokes().await?;
    let last_clear = state.store.last_clear().await?;
    let count = strokes.len();
    state.canvas.hydrate(strokes, last_clear);
    info!(strokes = count, generation = state.canvas.generation(), "canvas hydrated");
    Ok(count)
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
