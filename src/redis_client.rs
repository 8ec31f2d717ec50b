use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};

/// Cheaply cloneable handle to a multiplexed Redis connection.
///
/// The connection manager reconnects on its own; callers clone the inner
/// manager per operation and never hold it across await points they do not
/// own.
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}
