//! Redis Streams-backed durable queue between ingestion and persistence.
//!
//! One stream, one consumer group: entries stay pending until acknowledged,
//! so a worker that dies mid-flush leaves its batch claimable by another
//! group member. Delivery to the store is at-least-once by construction.

use std::collections::HashMap;

use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::Message;
use crate::redis_client::RedisClient;

const PAYLOAD_FIELD: &str = "data";

/// A claimed stream entry. `message` is `None` when the payload could not be
/// decoded; such entries are acknowledged and dropped by the consumer rather
/// than redelivered forever.
#[derive(Debug)]
pub struct QueueEntry {
    pub entry_id: String,
    pub message: Option<Message>,
}

#[derive(Clone)]
pub struct MessageQueue {
    redis: RedisClient,
    stream: String,
    group: String,
    consumer: String,
}

impl MessageQueue {
    pub fn new(redis: RedisClient, stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            redis,
            stream: stream.into(),
            group: group.into(),
            consumer: format!("consumer-{}", Uuid::new_v4()),
        }
    }

    /// Create the consumer group, creating the stream alongside it if
    /// needed. BUSYGROUP (already exists) is not an error.
    pub async fn ensure_group(&self) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let created: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(_) => tracing::info!(stream = %self.stream, group = %self.group, "consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(stream = %self.stream, group = %self.group, "consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Append a message to the stream. Returns the stream entry id.
    pub async fn append(&self, msg: &Message) -> AppResult<String> {
        let payload = serde_json::to_string(msg)?;
        let mut conn = self.redis.connection();
        let entry_id: String = conn
            .xadd(&self.stream, "*", &[(PAYLOAD_FIELD, payload.as_str())])
            .await?;
        Ok(entry_id)
    }

    /// Claim up to `count` unacknowledged entries for this consumer,
    /// blocking for at most `block_ms` when the stream is empty.
    pub async fn claim(&self, count: usize, block_ms: usize) -> AppResult<Vec<QueueEntry>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block_ms);
        let mut conn = self.redis.connection();
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push(decode_entry(&id));
            }
        }
        Ok(entries)
    }

    /// Take over entries that were claimed (by any consumer, this one
    /// included) but sat unacknowledged for at least `min_idle_ms`. This is
    /// what makes non-acknowledgment an actual retry: a failed flush or a
    /// worker that died mid-batch leaves its entries pending, and the next
    /// reclaim pass hands them to a live consumer.
    pub async fn reclaim(&self, count: usize, min_idle_ms: u64) -> AppResult<Vec<QueueEntry>> {
        let mut conn = self.redis.connection();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(decode_reclaimed(reply))
    }

    /// Acknowledge processed entries so they leave the pending list.
    pub async fn ack(&self, entry_ids: &[String]) -> AppResult<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.connection();
        let _: i64 = conn.xack(&self.stream, &self.group, entry_ids).await?;
        Ok(())
    }
}

/// Parse an XAUTOCLAIM reply: `[next-cursor, [[id, [field, value, ...]], ...]]`
/// (Redis 7 appends a third array of ids deleted from the stream, which we
/// ignore). Entries that do not parse as stream entries are skipped.
fn decode_reclaimed(reply: Value) -> Vec<QueueEntry> {
    let Value::Bulk(mut parts) = reply else {
        return Vec::new();
    };
    if parts.len() < 2 {
        return Vec::new();
    }
    let Value::Bulk(raw_entries) = parts.swap_remove(1) else {
        return Vec::new();
    };
    raw_entries
        .iter()
        .filter_map(|entry| {
            let (id, map): (String, HashMap<String, Value>) =
                redis::from_redis_value(entry).ok()?;
            Some(decode_entry(&StreamId { id, map }))
        })
        .collect()
}

fn decode_entry(id: &StreamId) -> QueueEntry {
    let message = id
        .get::<String>(PAYLOAD_FIELD)
        .and_then(|raw| serde_json::from_str(&raw).ok());
    QueueEntry {
        entry_id: id.id.clone(),
        message,
    }
}
