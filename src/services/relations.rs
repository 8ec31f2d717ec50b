//! Cache-aside lookups for relationship state the pipeline consumes:
//! which users belong to a conversation and which conversations a user
//! belongs to. The conversation-management component owns the underlying
//! rows; it must call `invalidate` on every membership mutation.

use redis::AsyncCommands;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::error::AppResult;
use crate::redis_client::RedisClient;

fn members_key(conversation_id: Uuid) -> String {
    format!("chat:relation:group_members:{conversation_id}")
}

fn user_conversations_key(user_id: Uuid) -> String {
    format!("chat:relation:user_groups:{user_id}")
}

#[derive(Clone)]
pub struct RelationCache {
    redis: RedisClient,
    db: Pool<Postgres>,
    ttl_secs: u64,
}

impl RelationCache {
    pub fn new(redis: RedisClient, db: Pool<Postgres>, ttl_secs: u64) -> Self {
        Self { redis, db, ttl_secs }
    }

    /// Member ids of a conversation, cached as a Redis set.
    pub async fn member_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        let key = members_key(conversation_id);
        if let Some(cached) = self.read_set(&key).await {
            return Ok(cached);
        }

        let rows =
            sqlx::query("SELECT user_id FROM conversation_members WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_all(&self.db)
                .await?;
        let ids: Vec<Uuid> = rows.iter().map(|r| r.get("user_id")).collect();
        self.fill_set(&key, &ids).await;
        Ok(ids)
    }

    /// Conversation ids a user participates in, cached as a Redis set.
    pub async fn conversation_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let key = user_conversations_key(user_id);
        if let Some(cached) = self.read_set(&key).await {
            return Ok(cached);
        }

        let rows = sqlx::query("SELECT conversation_id FROM conversation_members WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.db)
            .await?;
        let ids: Vec<Uuid> = rows.iter().map(|r| r.get("conversation_id")).collect();
        self.fill_set(&key, &ids).await;
        Ok(ids)
    }

    /// Drop cached relations touched by a membership mutation.
    pub async fn invalidate(&self, conversation_id: Uuid, user_ids: &[Uuid]) -> AppResult<()> {
        let mut keys = vec![members_key(conversation_id)];
        keys.extend(user_ids.iter().map(|id| user_conversations_key(*id)));
        let mut conn = self.redis.connection();
        let _: i64 = conn.del(keys).await?;
        Ok(())
    }

    async fn read_set(&self, key: &str) -> Option<Vec<Uuid>> {
        let mut conn = self.redis.connection();
        match conn.smembers::<_, Vec<String>>(key).await {
            Ok(raw) if !raw.is_empty() => Some(
                raw.iter()
                    .filter_map(|s| Uuid::parse_str(s).ok())
                    .collect(),
            ),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(%key, error = %e, "relation cache read failed, falling back to store");
                None
            }
        }
    }

    async fn fill_set(&self, key: &str, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("SADD").arg(key).arg(id.to_string()).ignore();
        }
        pipe.cmd("EXPIRE").arg(key).arg(self.ttl_secs).ignore();
        let mut conn = self.redis.connection();
        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            tracing::warn!(%key, error = %e, "relation cache fill failed");
        }
    }
}
