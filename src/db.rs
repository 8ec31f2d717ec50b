use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

/// Database connection pool configuration, tuned from env with safe defaults.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let parse = |key: &str, default| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            max_connections: parse("DB_MAX_CONNECTIONS", d.max_connections as u64) as u32,
            min_connections: parse("DB_MIN_CONNECTIONS", d.min_connections as u64) as u32,
            acquire_timeout_secs: parse("DB_ACQUIRE_TIMEOUT_SECS", d.acquire_timeout_secs),
            idle_timeout_secs: parse("DB_IDLE_TIMEOUT_SECS", d.idle_timeout_secs),
            max_lifetime_secs: parse("DB_MAX_LIFETIME_SECS", d.max_lifetime_secs),
        }
    }
}

pub async fn init_pool(database_url: &str) -> Result<Pool<Postgres>, sqlx::Error> {
    let cfg = DbConfig::from_env();
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .min_connections(cfg.min_connections)
        .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(cfg.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(cfg.max_lifetime_secs))
        .connect(database_url)
        .await?;
    info!(
        max_connections = cfg.max_connections,
        min_connections = cfg.min_connections,
        "database pool ready"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_sizing_is_sane() {
        let cfg = DbConfig::default();
        assert!(cfg.min_connections <= cfg.max_connections);
        assert!(cfg.acquire_timeout_secs > 0);
    }
}
