//! In-process store.
//!
//! DESIGN
//! ======
//! All tables live behind one mutex, so every operation (including the
//! counter and reaction increments) is atomic with respect to every other.
//! The lock is never held across an await.
//!
//! `set_failing(true)` makes every call return `StoreError::Unavailable`,
//! which is how tests exercise the persistence-failure paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Store, StoreError};
use crate::state::{BanRecord, ChatMessage, ClearMarker, PresenceRecord, Reactions, Stroke, TypingMarker};

#[derive(Default)]
struct Tables {
    chat: Vec<ChatMessage>,
    presence: BTreeMap<String, PresenceRecord>,
    visitor_total: i64,
    bans: HashMap<String, BanRecord>,
    profanity: Vec<String>,
    typing: HashMap<String, TypingMarker>,
    strokes: Vec<Stroke>,
    last_clear: Option<ClearMarker>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Administrative write; the relay itself only reads bans.
    pub fn insert_ban(&self, ban: BanRecord) {
        self.lock().bans.insert(ban.visitor_id.clone(), ban);
    }

    /// Administrative write; the relay itself only reads the word list.
    pub fn set_profanity_words(&self, words: &[&str]) {
        self.lock().profanity = words.iter().map(|w| (*w).to_string()).collect();
    }

    /// Presence row as last written, for inspection.
    #[must_use]
    pub fn presence_row(&self, visitor_id: &str) -> Option<PresenceRecord> {
        self.lock().presence.get(visitor_id).cloned()
    }

    #[must_use]
    pub fn typing_rows(&self) -> usize {
        self.lock().typing.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(self.lock())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_chat_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.tables()?.chat.push(message.clone());
        Ok(())
    }

    async fn recent_chat_messages(&self, limit: i64) -> Result<Vec<ChatMessage>, StoreError> {
        let tables = self.tables()?;
        let mut messages = tables.chat.clone();
        messages.sort_by_key(|m| m.time);
        let keep = usize::try_from(limit).unwrap_or(0);
        let skip = messages.len().saturating_sub(keep);
        Ok(messages.split_off(skip))
    }

    async fn increment_reaction(&self, message_id: &str, emoji: &str) -> Result<Option<Reactions>, StoreError> {
        let mut tables = self.tables()?;
        let Some(message) = tables.chat.iter_mut().find(|m| m.id == message_id) else {
            return Ok(None);
        };
        *message.reactions.entry(emoji.to_string()).or_insert(0) += 1;
        Ok(Some(message.reactions.clone()))
    }

    async fn set_online(&self, visitor_id: &str, username: &str, _at_ms: i64) -> Result<(), StoreError> {
        self.tables()?.presence.insert(
            visitor_id.to_string(),
            PresenceRecord { visitor_id: visitor_id.to_string(), username: username.to_string(), online: true, last_seen: None },
        );
        Ok(())
    }

    async fn set_offline(&self, visitor_id: &str, at_ms: i64) -> Result<(), StoreError> {
        if let Some(row) = self.tables()?.presence.get_mut(visitor_id) {
            row.online = false;
            row.last_seen = Some(at_ms);
        }
        Ok(())
    }

    async fn purge_offline(&self, before_ms: i64) -> Result<u64, StoreError> {
        let mut tables = self.tables()?;
        let before = tables.presence.len();
        tables
            .presence
            .retain(|_, row| row.online || row.last_seen.is_none_or(|seen| seen >= before_ms));
        Ok((before - tables.presence.len()) as u64)
    }

    async fn increment_visitor_total(&self) -> Result<i64, StoreError> {
        let mut tables = self.tables()?;
        tables.visitor_total += 1;
        Ok(tables.visitor_total)
    }

    async fn visitor_total(&self) -> Result<i64, StoreError> {
        Ok(self.tables()?.visitor_total)
    }

    async fn find_ban(&self, visitor_id: &str) -> Result<Option<BanRecord>, StoreError> {
        Ok(self.tables()?.bans.get(visitor_id).cloned())
    }

    async fn profanity_words(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables()?.profanity.clone())
    }

    async fn set_typing(&self, marker: &TypingMarker) -> Result<(), StoreError> {
        self.tables()?
            .typing
            .insert(marker.visitor_id.clone(), marker.clone());
        Ok(())
    }

    async fn remove_typing(&self, visitor_id: &str) -> Result<(), StoreError> {
        self.tables()?.typing.remove(visitor_id);
        Ok(())
    }

    async fn purge_typing(&self, before_ms: i64) -> Result<u64, StoreError> {
        let mut tables = self.tables()?;
        let before = tables.typing.len();
        tables.typing.retain(|_, marker| marker.ts >= before_ms);
        Ok((before - tables.typing.len()) as u64)
    }

    async fn append_stroke(&self, stroke: &Stroke) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if let Some(existing) = tables.strokes.iter_mut().find(|s| s.id == stroke.id) {
            existing.stroke_data = stroke.stroke_data.clone();
        } else {
            tables.strokes.push(stroke.clone());
        }
        Ok(())
    }

    async fn list_strokes(&self) -> Result<Vec<Stroke>, StoreError> {
        Ok(self.tables()?.strokes.clone())
    }

    async fn clear_strokes(&self, marker: &ClearMarker) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        tables.strokes.clear();
        tables.last_clear = Some(marker.clone());
        Ok(())
    }

    async fn last_clear(&self) -> Result<Option<ClearMarker>, StoreError> {
        Ok(self.tables()?.last_clear.clone())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
