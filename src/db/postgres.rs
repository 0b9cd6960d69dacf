//! `PostgreSQL` store.
//!
//! Counter and reaction increments are single `UPDATE ... RETURNING`
//! statements, so Postgres row locks serialize concurrent writers.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use super::{Store, StoreError};
use crate::state::{BanRecord, ChatMessage, ClearMarker, Reactions, Stroke, TypingMarker};

const LAST_CLEAR_KEY: &str = "last_clear";

type ChatRow = (String, String, String, String, i64, String, String, Option<String>, Json<Reactions>);

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn chat_from_row(row: ChatRow) -> ChatMessage {
    let (id, user, text, color, time, uid, avatar, avatar_image, Json(reactions)) = row;
    ChatMessage { id, user, text, color, time, uid, avatar, avatar_image, reactions }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_chat_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chat_messages (id, username, text, color, time, uid, avatar, avatar_image, reactions) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&message.id)
        .bind(&message.user)
        .bind(&message.text)
        .bind(&message.color)
        .bind(message.time)
        .bind(&message.uid)
        .bind(&message.avatar)
        .bind(&message.avatar_image)
        .bind(Json(&message.reactions))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_chat_messages(&self, limit: i64) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query_as::<_, ChatRow>(
            "SELECT id, username, text, color, time, uid, avatar, avatar_image, reactions
             FROM (
                SELECT id, username, text, color, time, uid, avatar, avatar_image, reactions
                FROM chat_messages
                ORDER BY time DESC
                LIMIT $1
             ) recent
             ORDER BY time ASC",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(chat_from_row).collect())
    }

    async fn increment_reaction(&self, message_id: &str, emoji: &str) -> Result<Option<Reactions>, StoreError> {
        let row = sqlx::query_scalar::<_, Json<Reactions>>(
            "UPDATE chat_messages
             SET reactions = jsonb_set(
                 reactions,
                 ARRAY[$2::text],
                 to_jsonb(COALESCE((reactions ->> $2)::bigint, 0) + 1)
             )
             WHERE id = $1
             RETURNING reactions",
        )
        .bind(message_id)
        .bind(emoji)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|Json(reactions)| reactions))
    }

    async fn set_online(&self, visitor_id: &str, username: &str, at_ms: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO online_users (visitor_id, username, online, timestamp, last_seen)
             VALUES ($1, $2, TRUE, $3, NULL)
             ON CONFLICT (visitor_id) DO UPDATE SET
                 username = EXCLUDED.username, online = TRUE, timestamp = EXCLUDED.timestamp, last_seen = NULL",
        )
        .bind(visitor_id)
        .bind(username)
        .bind(at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_offline(&self, visitor_id: &str, at_ms: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE online_users SET online = FALSE, last_seen = $2 WHERE visitor_id = $1")
            .bind(visitor_id)
            .bind(at_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_offline(&self, before_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM online_users WHERE online = FALSE AND last_seen < $1")
            .bind(before_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn increment_visitor_total(&self) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "UPDATE visitor_stats SET total_visitors = total_visitors + 1, updated_at = now()
             WHERE id = 1
             RETURNING total_visitors",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn visitor_total(&self) -> Result<i64, StoreError> {
        let total: Option<i64> = sqlx::query_scalar("SELECT total_visitors FROM visitor_stats WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(total.unwrap_or(0))
    }

    async fn find_ban(&self, visitor_id: &str) -> Result<Option<BanRecord>, StoreError> {
        let row = sqlx::query_as::<_, (String, Option<String>, Option<i64>)>(
            "SELECT uid, reason, expires_at FROM banned_users WHERE uid = $1",
        )
        .bind(visitor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(visitor_id, reason, expires_at)| BanRecord { visitor_id, reason, expires_at }))
    }

    async fn profanity_words(&self) -> Result<Vec<String>, StoreError> {
        let words = sqlx::query_scalar::<_, String>("SELECT word FROM profanity_words ORDER BY word")
            .fetch_all(&self.pool)
            .await?;
        Ok(words)
    }

    async fn set_typing(&self, marker: &TypingMarker) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO typing_indicators (visitor_id, username, timestamp) VALUES ($1, $2, $3)
             ON CONFLICT (visitor_id) DO UPDATE SET username = EXCLUDED.username, timestamp = EXCLUDED.timestamp",
        )
        .bind(&marker.visitor_id)
        .bind(&marker.username)
        .bind(marker.ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_typing(&self, visitor_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM typing_indicators WHERE visitor_id = $1")
            .bind(visitor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_typing(&self, before_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM typing_indicators WHERE timestamp < $1")
            .bind(before_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_stroke(&self, stroke: &Stroke) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO canvas_strokes (id, stroke_data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET stroke_data = EXCLUDED.stroke_data",
        )
        .bind(&stroke.id)
        .bind(&stroke.stroke_data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_strokes(&self) -> Result<Vec<Stroke>, StoreError> {
        let rows = sqlx::query_as::<_, (String, serde_json::Value)>(
            "SELECT id, stroke_data FROM canvas_strokes ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, stroke_data)| Stroke { id, stroke_data })
            .collect())
    }

    async fn clear_strokes(&self, marker: &ClearMarker) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM canvas_strokes")
            .execute(tx.as_mut())
            .await?;
        sqlx::query(
            "INSERT INTO canvas_meta (key, value, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(LAST_CLEAR_KEY)
        .bind(serde_json::to_value(marker)?)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn last_clear(&self) -> Result<Option<ClearMarker>, StoreError> {
        let value = sqlx::query_scalar::<_, serde_json::Value>("SELECT value FROM canvas_meta WHERE key = $1")
            .bind(LAST_CLEAR_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }
}

#[cfg(all(test, feature = "live-db-tests"))]
#[path = "postgres_test.rs"]
mod tests;
