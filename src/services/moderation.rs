//! Moderation gate — read path for bans and the profanity list.
//!
//! DESIGN
//! ======
//! Bans are looked up in the store on every chat send and compared against
//! the clock at read time; an expired ban needs no cleanup to stop applying.
//! The profanity list changes rarely, so it is cached here and refreshed at
//! startup and on each cleanup tick. Ban and word-list mutation is
//! administrative and lives outside the relay.

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::db::{Store, StoreError};
use crate::state::now_ms;

#[derive(Clone)]
pub struct ModerationGate {
    store: Arc<dyn Store>,
    /// Lowercased words.
    profanity: Arc<RwLock<Vec<String>>>,
}

impl ModerationGate {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, profanity: Arc::default() }
    }

    /// Whether the visitor holds an active ban right now.
    ///
    /// # Errors
    ///
    /// Returns the store error if the lookup fails. Callers treat that as a
    /// rejection.
    pub async fn is_banned(&self, visitor_id: &str) -> Result<bool, StoreError> {
        let ban = self.store.find_ban(visitor_id).await?;
        Ok(ban.is_some_and(|ban| ban.is_active(now_ms())))
    }

    /// Reload the cached profanity list. Returns the number of words cached.
    ///
    /// # Errors
    ///
    /// Returns the store error if the list cannot be read; the previous
    /// cache is kept.
    pub async fn refresh_profanity(&self) -> Result<usize, StoreError> {
        let words: Vec<String> = self
            .store
            .profanity_words()
            .await?
            .into_iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        let count = words.len();
        *self.profanity.write().unwrap_or_else(std::sync::PoisonError::into_inner) = words;
        debug!(count, "profanity list refreshed");
        Ok(count)
    }

    /// Replace every listed word (case-insensitive, whole word) with `*` of
    /// the same length. A word is a run of alphanumeric characters.
    #[must_use]
    pub fn mask_profanity(&self, text: &str) -> String {
        let words = self.profanity.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        if words.is_empty() {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        let mut word = String::new();
        for ch in text.chars() {
            if ch.is_alphanumeric() {
                word.push(ch);
            } else {
                flush_word(&mut out, &mut word, &words);
                out.push(ch);
            }
        }
        flush_word(&mut out, &mut word, &words);
        out
    }
}

fn flush_word(out: &mut String, word: &mut String, listed: &[String]) {
    if word.is_empty() {
        return;
    }
    let lowered = word.to_lowercase();
    if listed.iter().any(|w| *w == lowered) {
        out.extend(std::iter::repeat_n('*', word.chars().count()));
    } else {
        out.push_str(word);
    }
    word.clear();
}

#[cfg(test)]
#[path = "moderation_test.rs"]
mod tests;
