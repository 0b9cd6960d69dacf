//! Persistence gateway — durable CRUD behind the `Store` trait.
//!
//! SYSTEM CONTEXT
//! ==============
//! The relay never owns a transaction layer. Every row-level read-modify-write
//! it relies on (visitor counter, reaction counts) is a single atomic store
//! operation, so concurrent handlers may call in freely.
//!
//! Two implementations ship: `postgres::PgStore` for deployments and
//! `memory::MemoryStore` for local runs without `DATABASE_URL` and for tests.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::state::{BanRecord, ChatMessage, ClearMarker, Reactions, Stroke, TypingMarker};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored payload is invalid: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// STORE
// =============================================================================

/// Durable CRUD surface consumed by the relay core.
#[async_trait]
pub trait Store: Send + Sync {
    // --- chat ---

    async fn insert_chat_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// The newest `limit` messages, returned oldest first.
    async fn recent_chat_messages(&self, limit: i64) -> Result<Vec<ChatMessage>, StoreError>;

    /// Atomically add one to `emoji` on a message. Returns the updated
    /// reaction map, or `None` if the message does not exist.
    async fn increment_reaction(&self, message_id: &str, emoji: &str) -> Result<Option<Reactions>, StoreError>;

    // --- presence ---

    async fn set_online(&self, visitor_id: &str, username: &str, at_ms: i64) -> Result<(), StoreError>;

    async fn set_offline(&self, visitor_id: &str, at_ms: i64) -> Result<(), StoreError>;

    /// Delete offline rows last seen before `before_ms`. Returns rows removed.
    async fn purge_offline(&self, before_ms: i64) -> Result<u64, StoreError>;

    // --- visitor counter ---

    /// Atomically increment the visitor counter and return the new total.
    async fn increment_visitor_total(&self) -> Result<i64, StoreError>;

    async fn visitor_total(&self) -> Result<i64, StoreError>;

    // --- moderation ---

    async fn find_ban(&self, visitor_id: &str) -> Result<Option<BanRecord>, StoreError>;

    async fn profanity_words(&self) -> Result<Vec<String>, StoreError>;

    // --- typing ---

    async fn set_typing(&self, marker: &TypingMarker) -> Result<(), StoreError>;

    async fn remove_typing(&self, visitor_id: &str) -> Result<(), StoreError>;

    async fn purge_typing(&self, before_ms: i64) -> Result<u64, StoreError>;

    // --- canvas ---

    /// Append a stroke, or replace the payload of an existing stroke id.
    async fn append_stroke(&self, stroke: &Stroke) -> Result<(), StoreError>;

    /// All strokes in append order.
    async fn list_strokes(&self) -> Result<Vec<Stroke>, StoreError>;

    /// Delete every stroke and record the clear marker.
    async fn clear_strokes(&self, marker: &ClearMarker) -> Result<(), StoreError>;

    async fn last_clear(&self) -> Result<Option<ClearMarker>, StoreError>;
}

// =============================================================================
// STARTUP
// =============================================================================

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

/// Open the configured store: Postgres when `DATABASE_URL` is set, otherwise
/// the in-process store.
///
/// # Errors
///
/// Returns an error if Postgres is configured but unreachable or migrations fail.
pub async fn connect(config: &RelayConfig) -> Result<Arc<dyn Store>, StoreError> {
    if let Some(url) = &config.database_url {
        let pool = init_pool(url, config.db_max_connections).await?;
        info!(max_connections = config.db_max_connections, "postgres store ready");
        return Ok(Arc::new(postgres::PgStore::new(pool)));
    }
    warn!("DATABASE_URL not set; relay state is kept in memory only");
    Ok(Arc::new(memory::MemoryStore::new()))
}
