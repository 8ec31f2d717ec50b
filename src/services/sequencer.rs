use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::AppResult;
use crate::redis_client::RedisClient;

fn seq_key(conversation_id: Uuid) -> String {
    format!("chat:seq:{conversation_id}")
}

/// Issues a monotonically increasing sequence number per conversation via a
/// keyed atomic increment. Conversations never contend with each other.
#[derive(Clone)]
pub struct Sequencer {
    redis: RedisClient,
}

impl Sequencer {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    /// Next sequence number for the conversation. If the counter store is
    /// unreachable this returns 0 instead of failing: the message is still
    /// accepted, only gap-repair for it is degraded.
    pub async fn next_seq(&self, conversation_id: Uuid) -> i64 {
        let mut conn = self.redis.connection();
        match conn.incr::<_, _, i64>(seq_key(conversation_id), 1).await {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(%conversation_id, error = %e, "sequencer unavailable, issuing unset seq");
                0
            }
        }
    }

    /// Drop the counter entirely; part of whole-conversation teardown.
    pub async fn reset(&self, conversation_id: Uuid) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let _: i64 = conn.del(seq_key(conversation_id)).await?;
        Ok(())
    }
}
