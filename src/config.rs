use dotenvy::dotenv;
use std::env;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub enabled: bool,
    pub stream_name: String,
    pub group_name: String,
    pub flush_batch_size: usize,
    pub flush_block_ms: usize,
    pub flush_poll_interval_ms: u64,
    /// Pending entries idle for at least this long are taken over from their
    /// original consumer and re-flushed.
    pub flush_reclaim_idle_ms: u64,
    pub flush_workers: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub relation_ttl_secs: u64,
    pub revoke_window_secs: i64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let queue = QueueConfig {
            enabled: env_parse("CHAT_QUEUE_ENABLED", true),
            stream_name: env::var("CHAT_STREAM_NAME")
                .unwrap_or_else(|_| "chat:messages:stream".into()),
            group_name: env::var("CHAT_GROUP_NAME")
                .unwrap_or_else(|_| "chat:messages:group".into()),
            flush_batch_size: env_parse("FLUSH_BATCH_SIZE", 100),
            flush_block_ms: env_parse("FLUSH_BLOCK_MS", 5000),
            flush_poll_interval_ms: env_parse("FLUSH_POLL_INTERVAL_MS", 100),
            flush_reclaim_idle_ms: env_parse("FLUSH_RECLAIM_IDLE_MS", 30_000),
            flush_workers: env_parse("FLUSH_WORKERS", 1),
        };

        let cache = CacheConfig {
            capacity: env_parse("CACHE_CAPACITY", 50),
            ttl_secs: env_parse("CACHE_TTL_SECS", 24 * 60 * 60),
        };

        Ok(Self {
            database_url,
            redis_url,
            queue,
            cache,
            relation_ttl_secs: env_parse("RELATION_TTL_SECS", 24 * 60 * 60),
            revoke_window_secs: env_parse("REVOKE_WINDOW_SECS", 120),
        })
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/test".into(),
            redis_url: "redis://127.0.0.1:6379/0".into(),
            queue: QueueConfig {
                enabled: true,
                stream_name: "chat:messages:stream".into(),
                group_name: "chat:messages:group".into(),
                flush_batch_size: 100,
                flush_block_ms: 5000,
                flush_poll_interval_ms: 100,
                flush_reclaim_idle_ms: 30_000,
                flush_workers: 1,
            },
            cache: CacheConfig {
                capacity: 50,
                ttl_secs: 24 * 60 * 60,
            },
            relation_ttl_secs: 24 * 60 * 60,
            revoke_window_secs: 120,
        }
    }
}
