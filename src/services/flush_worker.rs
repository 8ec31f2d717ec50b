//! Background worker that drains the durable queue into Postgres.
//!
//! Loop: claim a batch from the consumer group, bulk-insert it, acknowledge
//! only after the insert commits. A failed flush leaves the batch pending so
//! the group redelivers it; redelivered rows are skipped by the insert's
//! `ON CONFLICT (id) DO NOTHING`, which is how crash-after-flush-before-ack
//! stays safe under at-least-once delivery.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, QueryBuilder};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::AppResult;
use crate::models::Message;
use crate::queue::MessageQueue;

pub struct FlushWorker {
    db: Pool<Postgres>,
    queue: MessageQueue,
    batch_size: usize,
    block_ms: usize,
    poll_interval: Duration,
    reclaim_idle_ms: u64,
}

impl FlushWorker {
    pub fn new(db: Pool<Postgres>, queue: MessageQueue, cfg: &QueueConfig) -> Self {
        Self {
            db,
            queue,
            batch_size: cfg.flush_batch_size,
            block_ms: cfg.flush_block_ms,
            poll_interval: Duration::from_millis(cfg.flush_poll_interval_ms),
            reclaim_idle_ms: cfg.flush_reclaim_idle_ms,
        }
    }

    /// Run until the process exits. Abrupt termination is safe: anything
    /// claimed but unacknowledged is redelivered to another group member.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        loop {
            match self.tick().await {
                Ok(0) => sleep(self.poll_interval).await,
                Ok(flushed) => tracing::debug!(flushed, "flushed message batch"),
                Err(e) => {
                    tracing::warn!(error = %e, "flush cycle failed, batch left pending for redelivery");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// One claim/flush/ack cycle. Returns the number of messages persisted.
    ///
    /// Stale pending entries come first: anything claimed earlier (by this
    /// consumer or a dead one) that outlived the idle threshold is taken
    /// over and re-flushed before new entries are read.
    pub async fn tick(&self) -> AppResult<usize> {
        let mut entries = self
            .queue
            .reclaim(self.batch_size, self.reclaim_idle_ms)
            .await?;
        if entries.is_empty() {
            entries = self.queue.claim(self.batch_size, self.block_ms).await?;
        }
        if entries.is_empty() {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(entries.len());
        let mut batch_ids = Vec::with_capacity(entries.len());
        let mut malformed = Vec::new();
        for entry in entries {
            match entry.message {
                Some(msg) => {
                    batch.push(msg);
                    batch_ids.push(entry.entry_id);
                }
                None => malformed.push(entry.entry_id),
            }
        }

        // Malformed payloads are dropped, not retried: ack them right away
        // so they cannot wedge the stream.
        if !malformed.is_empty() {
            tracing::warn!(count = malformed.len(), "dropping malformed queue entries");
            self.queue.ack(&malformed).await?;
        }

        if batch.is_empty() {
            return Ok(0);
        }

        flush(&self.db, &batch).await?;
        self.queue.ack(&batch_ids).await?;
        Ok(batch.len())
    }
}

/// Persist a batch in one transaction, then advance each touched
/// conversation's recency marker. The recency update is best-effort: the
/// batch is already durable, so a failure here only leaves conversation
/// ordering stale until a later batch corrects it.
pub async fn flush(db: &Pool<Postgres>, batch: &[Message]) -> AppResult<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut tx = db.begin().await?;
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO messages (id, conversation_id, sender_id, seq_id, client_msg_id, \
         message_type, content, duration_ms, thumbnail_url, is_revoked, created_at) ",
    );
    qb.push_values(batch, |mut b, m| {
        b.push_bind(m.id)
            .push_bind(m.conversation_id)
            .push_bind(m.sender_id)
            .push_bind(m.seq_id)
            .push_bind(m.client_msg_id.clone())
            .push_bind(m.kind.as_str())
            .push_bind(m.content.clone())
            .push_bind(m.duration_ms)
            .push_bind(m.thumbnail_url.clone())
            .push_bind(m.is_revoked)
            .push_bind(m.created_at);
    });
    qb.push(" ON CONFLICT (id) DO NOTHING");
    qb.build().execute(&mut *tx).await?;
    tx.commit().await?;

    for (conversation_id, last_activity) in latest_activity(batch) {
        let touched = sqlx::query(
            "UPDATE conversations SET updated_at = GREATEST(updated_at, $2) WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(last_activity)
        .execute(db)
        .await;
        if let Err(e) = touched {
            tracing::warn!(%conversation_id, error = %e, "conversation recency update failed");
        }
    }

    Ok(())
}

/// Per-conversation maximum `created_at` across a batch.
pub fn latest_activity(batch: &[Message]) -> HashMap<Uuid, DateTime<Utc>> {
    let mut map: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    for m in batch {
        map.entry(m.conversation_id)
            .and_modify(|t| {
                if m.created_at > *t {
                    *t = m.created_at;
                }
            })
            .or_insert(m.created_at);
    }
    map
}
