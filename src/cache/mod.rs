//! Bounded per-conversation list of the most recent messages.
//!
//! Entries are only ever pushed at the head, so eviction is size-bound plus
//! TTL with no promotion. The cache is a read-through accelerator, never the
//! source of truth: it must tolerate being empty at any point.

use redis::AsyncCommands;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Message, Sender};
use crate::redis_client::RedisClient;

fn cache_key(conversation_id: Uuid) -> String {
    format!("chat:cache:{conversation_id}")
}

#[derive(Clone)]
pub struct MessageCache {
    redis: RedisClient,
    db: Pool<Postgres>,
    capacity: usize,
    ttl_secs: u64,
}

impl MessageCache {
    pub fn new(redis: RedisClient, db: Pool<Postgres>, capacity: usize, ttl_secs: u64) -> Self {
        Self {
            redis,
            db,
            capacity,
            ttl_secs,
        }
    }

    /// Push a freshly ingested message to the head of its conversation list,
    /// trimming to capacity and refreshing the TTL. The sender identity is
    /// denormalized into the payload first so cache reads never need a
    /// secondary lookup.
    pub async fn push(&self, msg: &mut Message) -> AppResult<()> {
        if msg.sender.is_none() {
            if let Some(sender_id) = msg.sender_id {
                msg.sender = self.resolve_sender(sender_id).await?;
            }
        }

        let key = cache_key(msg.conversation_id);
        let payload = serde_json::to_string(msg)?;
        let mut conn = self.redis.connection();
        redis::pipe()
            .cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(self.capacity as isize - 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Most-recent-first page from the cache. Undecodable entries are
    /// skipped, not surfaced; the store remains authoritative.
    pub async fn read(&self, conversation_id: Uuid, limit: usize) -> AppResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = cache_key(conversation_id);
        let mut conn = self.redis.connection();
        let raw: Vec<String> = conn.lrange(&key, 0, limit as isize - 1).await?;

        let mut messages = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<Message>(&item) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    tracing::warn!(%conversation_id, error = %e, "dropping undecodable cache entry")
                }
            }
        }
        Ok(messages)
    }

    /// Wholesale invalidation; the next read falls through to the store and
    /// repopulates. Used on revoke and conversation teardown.
    pub async fn invalidate(&self, conversation_id: Uuid) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let _: i64 = conn.del(cache_key(conversation_id)).await?;
        Ok(())
    }

    async fn resolve_sender(&self, sender_id: Uuid) -> AppResult<Option<Sender>> {
        let row = sqlx::query("SELECT id, name, avatar_url FROM users WHERE id = $1")
            .bind(sender_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|r| Sender {
            id: r.get("id"),
            name: r.get("name"),
            avatar_url: r.get("avatar_url"),
        }))
    }
}
