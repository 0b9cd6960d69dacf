//! Runtime configuration.
//!
//! DESIGN
//! ======
//! Every knob is an environment variable with a compiled-in default, read
//! once at startup. Unparseable values fall back to the default rather than
//! aborting, matching how the persistence and database settings behave.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_RESYNC_INTERVAL_MS: u64 = 5_000;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 10_000;
const DEFAULT_TYPING_TTL_MS: i64 = 5_000;
const DEFAULT_TYPING_RETENTION_MS: i64 = 10_000;
const DEFAULT_PRESENCE_RETENTION_SECS: i64 = 3_600;
const DEFAULT_RECENT_CHAT_LIMIT: i64 = 50;
const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be greater than zero")]
    NonPositive { key: &'static str },
}

/// Relay settings shared by the transport, presence timers and router.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// `None` runs the relay against the in-process store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Period of the online/total/typing heartbeat broadcast.
    pub resync_interval: Duration,
    /// Period of the stale typing/presence sweep.
    pub cleanup_interval: Duration,
    /// Typing markers older than this are hidden from the typing view.
    pub typing_ttl_ms: i64,
    /// Typing markers older than this are deleted by the sweep.
    pub typing_retention_ms: i64,
    /// Offline presence records older than this are purged.
    pub presence_retention_ms: i64,
    /// Messages replayed in `chat:initial`.
    pub recent_chat_limit: i64,
    /// Bounded outbound queue per session.
    pub client_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            resync_interval: Duration::from_millis(DEFAULT_RESYNC_INTERVAL_MS),
            cleanup_interval: Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS),
            typing_ttl_ms: DEFAULT_TYPING_TTL_MS,
            typing_retention_ms: DEFAULT_TYPING_RETENTION_MS,
            presence_retention_ms: DEFAULT_PRESENCE_RETENTION_SECS * 1000,
            recent_chat_limit: DEFAULT_RECENT_CHAT_LIMIT,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
        }
    }
}

impl RelayConfig {
    /// Load settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a period or capacity is configured as zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            resync_interval: Duration::from_millis(env_parse("RESYNC_INTERVAL_MS", DEFAULT_RESYNC_INTERVAL_MS)),
            cleanup_interval: Duration::from_millis(env_parse("CLEANUP_INTERVAL_MS", DEFAULT_CLEANUP_INTERVAL_MS)),
            typing_ttl_ms: env_parse("TYPING_TTL_MS", DEFAULT_TYPING_TTL_MS),
            typing_retention_ms: env_parse("TYPING_RETENTION_MS", DEFAULT_TYPING_RETENTION_MS),
            presence_retention_ms: env_parse("PRESENCE_RETENTION_SECS", DEFAULT_PRESENCE_RETENTION_SECS) * 1000,
            recent_chat_limit: env_parse("RECENT_CHAT_LIMIT", DEFAULT_RECENT_CHAT_LIMIT),
            client_queue_capacity: env_parse("CLIENT_QUEUE_CAPACITY", DEFAULT_CLIENT_QUEUE_CAPACITY),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.resync_interval.is_zero() {
            return Err(ConfigError::NonPositive { key: "RESYNC_INTERVAL_MS" });
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::NonPositive { key: "CLEANUP_INTERVAL_MS" });
        }
        if self.client_queue_capacity == 0 {
            return Err(ConfigError::NonPositive { key: "CLIENT_QUEUE_CAPACITY" });
        }
        if self.recent_chat_limit <= 0 {
            return Err(ConfigError::NonPositive { key: "RECENT_CHAT_LIMIT" });
        }
        Ok(())
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
