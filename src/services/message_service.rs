//! Write entry point and read path for conversation messages.
//!
//! Writes go queue-first: the message is stamped (id, timestamp, sequence),
//! appended to the durable queue, and the call returns before the relational
//! store has seen it. Only when the queue is unavailable does the ingestor
//! fall back to a synchronous transactional write. Callers cannot tell which
//! path ran.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::cache::MessageCache;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{Message, MessageKind};
use crate::queue::MessageQueue;
use crate::redis_client::RedisClient;
use crate::services::conversation_service::ConversationService;
use crate::services::relations::RelationCache;
use crate::services::sequencer::Sequencer;
use crate::services::visibility::VisibilityManager;

const REVOKED_CONTENT: &str = "[message revoked]";

/// Input for `send_message`. Identity and ordering fields are stamped by the
/// ingestor, never supplied by the caller.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    pub client_msg_id: Option<String>,
    pub duration_ms: Option<i32>,
    pub thumbnail_url: Option<String>,
}

impl NewMessage {
    pub fn text(conversation_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id: Some(sender_id),
            kind: MessageKind::Text,
            content: content.into(),
            client_msg_id: None,
            duration_ms: None,
            thumbnail_url: None,
        }
    }
}

/// Pagination cursor for history reads. Modes are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cursor {
    /// Freshest page, no anchor.
    #[default]
    Latest,
    /// Strictly older (by `created_at`) than the referenced message.
    Before(Uuid),
    /// Strictly newer than the referenced message.
    After(Uuid),
    /// Strictly greater `seq_id`; gap-repair resync.
    AfterSeq(i64),
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub text: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub cursor: Cursor,
}

impl HistoryQuery {
    pub fn latest(limit: i64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

/// The cache can only answer "give me the freshest page": no cursor, no text
/// filter, zero offset.
fn cache_eligible(q: &HistoryQuery) -> bool {
    q.text.is_none() && q.offset == 0 && q.cursor == Cursor::Latest
}

/// Concatenate a cache page with its store continuation, dropping any store
/// row the cache already returned.
fn merge_page(cached: Vec<Message>, rest: Vec<Message>) -> Vec<Message> {
    let seen: HashSet<Uuid> = cached.iter().map(|m| m.id).collect();
    let mut out = cached;
    out.extend(rest.into_iter().filter(|m| !seen.contains(&m.id)));
    out
}

fn revoke_window_open(created_at: DateTime<Utc>, window_secs: i64, now: DateTime<Utc>) -> bool {
    now - created_at <= Duration::seconds(window_secs)
}

/// Resolved store predicate; `Before`/`After` cursors are translated to the
/// referenced message's timestamp before querying.
enum StorePred {
    None,
    Before(DateTime<Utc>),
    After(DateTime<Utc>),
    AfterSeq(i64),
}

#[derive(Clone)]
pub struct MessageService {
    db: Pool<Postgres>,
    queue: Option<MessageQueue>,
    sequencer: Sequencer,
    cache: MessageCache,
    relations: RelationCache,
    config: Arc<Config>,
}

impl MessageService {
    pub fn new(db: Pool<Postgres>, redis: RedisClient, config: Arc<Config>) -> Self {
        let queue = config.queue.enabled.then(|| {
            MessageQueue::new(
                redis.clone(),
                config.queue.stream_name.clone(),
                config.queue.group_name.clone(),
            )
        });
        let cache = MessageCache::new(
            redis.clone(),
            db.clone(),
            config.cache.capacity,
            config.cache.ttl_secs,
        );
        let relations = RelationCache::new(redis.clone(), db.clone(), config.relation_ttl_secs);
        Self {
            db,
            queue,
            sequencer: Sequencer::new(redis),
            cache,
            relations,
            config,
        }
    }

    pub fn db(&self) -> &Pool<Postgres> {
        &self.db
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    /// Ingest a caller-authored message. Returns as soon as the message is
    /// accepted by the queue; durability in the relational store follows
    /// asynchronously unless the fallback path ran.
    pub async fn send_message(&self, new: NewMessage) -> AppResult<Message> {
        if new.kind == MessageKind::Text && new.content.trim().is_empty() {
            return Err(AppError::BadRequest("message content is empty".into()));
        }
        if let Some(sender_id) = new.sender_id {
            if !ConversationService::is_member(&self.db, new.conversation_id, sender_id).await? {
                return Err(AppError::NotAMember);
            }
        }
        self.ingest(new).await
    }

    /// Sender-less message authored by the platform itself (joins, renames).
    pub async fn send_system_message(
        &self,
        conversation_id: Uuid,
        content: impl Into<String>,
    ) -> AppResult<Message> {
        self.ingest(NewMessage {
            conversation_id,
            sender_id: None,
            kind: MessageKind::System,
            content: content.into(),
            client_msg_id: None,
            duration_ms: None,
            thumbnail_url: None,
        })
        .await
    }

    async fn ingest(&self, new: NewMessage) -> AppResult<Message> {
        let msg = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            seq_id: self.sequencer.next_seq(new.conversation_id).await,
            client_msg_id: new.client_msg_id,
            kind: new.kind,
            content: new.content,
            duration_ms: new.duration_ms,
            thumbnail_url: new.thumbnail_url,
            is_revoked: false,
            created_at: Utc::now(),
            sender: None,
        };

        // Any new message un-hides the conversation for every member that
        // hid it, on either write path. Dispatched without awaiting; a
        // failure is logged, never surfaced to the sender.
        let db = self.db.clone();
        let conversation_id = msg.conversation_id;
        tokio::spawn(async move {
            if let Err(e) = VisibilityManager::unhide_all(&db, conversation_id).await {
                tracing::warn!(%conversation_id, error = %e, "visibility auto-clear failed");
            }
        });

        match &self.queue {
            Some(queue) => match queue.append(&msg).await {
                Ok(_) => {
                    let cache = self.cache.clone();
                    let mut cached = msg.clone();
                    tokio::spawn(async move {
                        if let Err(e) = cache.push(&mut cached).await {
                            tracing::warn!(message_id = %cached.id, error = %e, "cache push failed");
                        }
                    });
                    Ok(msg)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "queue append failed, falling back to direct write");
                    self.fallback_insert(&msg).await?;
                    Ok(msg)
                }
            },
            None => {
                self.fallback_insert(&msg).await?;
                Ok(msg)
            }
        }
    }

    /// Synchronous degraded path: persist the message and advance the
    /// conversation's recency marker in one transaction.
    async fn fallback_insert(&self, msg: &Message) -> AppResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, seq_id, client_msg_id, \
             message_type, content, duration_ms, thumbnail_url, is_revoked, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(msg.id)
        .bind(msg.conversation_id)
        .bind(msg.sender_id)
        .bind(msg.seq_id)
        .bind(&msg.client_msg_id)
        .bind(msg.kind.as_str())
        .bind(&msg.content)
        .bind(msg.duration_ms)
        .bind(&msg.thumbnail_url)
        .bind(msg.is_revoked)
        .bind(msg.created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE conversations SET updated_at = GREATEST(updated_at, $2) WHERE id = $1")
            .bind(msg.conversation_id)
            .bind(msg.created_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Paginated history, newest first. The cache answers the freshest page
    /// when it can; everything else is a cursor query against the store.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester_id: Uuid,
        q: &HistoryQuery,
    ) -> AppResult<Vec<Message>> {
        if !ConversationService::is_member(&self.db, conversation_id, requester_id).await? {
            return Err(AppError::NotAMember);
        }

        let limit = q.limit.clamp(1, 200);

        if cache_eligible(q) {
            let cached = match self.cache.read(conversation_id, limit as usize).await {
                Ok(cached) => cached,
                Err(e) => {
                    tracing::warn!(%conversation_id, error = %e, "cache read failed, serving from store");
                    Vec::new()
                }
            };
            if cached.len() >= limit as usize {
                return Ok(cached);
            }
            if let Some(oldest) = cached.last() {
                let pred = StorePred::Before(oldest.created_at);
                let rest = self
                    .query_store(conversation_id, None, pred, limit - cached.len() as i64, 0)
                    .await?;
                return Ok(merge_page(cached, rest));
            }
        }

        let pred = self.resolve_cursor(q.cursor).await?;
        self.query_store(conversation_id, q.text.as_deref(), pred, limit, q.offset)
            .await
    }

    /// Half a page before (and including) the target message plus half a
    /// page after it, in ascending order.
    pub async fn get_message_context(
        &self,
        message_id: Uuid,
        requester_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let target = self.get_message(message_id).await?;
        if !ConversationService::is_member(&self.db, target.conversation_id, requester_id).await? {
            return Err(AppError::NotAMember);
        }

        let half = (limit / 2).max(1);
        let before = sqlx::query(
            "SELECT id, conversation_id, sender_id, seq_id, client_msg_id, message_type, \
                    content, duration_ms, thumbnail_url, is_revoked, created_at \
             FROM messages WHERE conversation_id = $1 AND created_at <= $2 \
             ORDER BY created_at DESC LIMIT $3",
        )
        .bind(target.conversation_id)
        .bind(target.created_at)
        .bind(half + 1)
        .fetch_all(&self.db)
        .await?;
        let after = sqlx::query(
            "SELECT id, conversation_id, sender_id, seq_id, client_msg_id, message_type, \
                    content, duration_ms, thumbnail_url, is_revoked, created_at \
             FROM messages WHERE conversation_id = $1 AND created_at > $2 \
             ORDER BY created_at ASC LIMIT $3",
        )
        .bind(target.conversation_id)
        .bind(target.created_at)
        .bind(half)
        .fetch_all(&self.db)
        .await?;

        let mut out: Vec<Message> = before
            .iter()
            .map(Message::from_row)
            .collect::<Result<_, _>>()?;
        out.reverse();
        for row in &after {
            out.push(Message::from_row(row)?);
        }
        Ok(out)
    }

    pub async fn get_message(&self, message_id: Uuid) -> AppResult<Message> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, seq_id, client_msg_id, message_type, \
                    content, duration_ms, thumbnail_url, is_revoked, created_at \
             FROM messages WHERE id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::NotFound)?;
        Ok(Message::from_row(&row)?)
    }

    /// Replace a message's content within the revoke window. Only the sender
    /// may revoke; `id`, `seq_id`, and `created_at` are preserved. The
    /// conversation's cache entry is invalidated wholesale so the next read
    /// repopulates from the store.
    pub async fn revoke_message(
        &self,
        message_id: Uuid,
        requester_id: Uuid,
    ) -> AppResult<Message> {
        let mut msg = self.get_message(message_id).await?;
        if msg.sender_id != Some(requester_id) {
            return Err(AppError::Forbidden);
        }
        if msg.is_revoked {
            return Ok(msg);
        }
        if !revoke_window_open(msg.created_at, self.config.revoke_window_secs, Utc::now()) {
            return Err(AppError::RevokeWindowExpired {
                created_at: msg.created_at,
                window_secs: self.config.revoke_window_secs,
            });
        }

        sqlx::query("UPDATE messages SET is_revoked = TRUE, content = $2 WHERE id = $1")
            .bind(message_id)
            .bind(REVOKED_CONTENT)
            .execute(&self.db)
            .await?;
        msg.is_revoked = true;
        msg.content = REVOKED_CONTENT.to_string();

        if let Err(e) = self.cache.invalidate(msg.conversation_id).await {
            tracing::warn!(conversation_id = %msg.conversation_id, error = %e, "cache invalidation failed after revoke");
        }
        Ok(msg)
    }

    /// Advance a member's read receipt to the given message. The message's
    /// own timestamp is resolved server-side; the receipt never regresses.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<()> {
        let read_time: DateTime<Utc> =
            sqlx::query_scalar("SELECT created_at FROM messages WHERE id = $1")
                .bind(message_id)
                .fetch_optional(&self.db)
                .await?
                .ok_or(AppError::NotFound)?;

        sqlx::query(
            "UPDATE conversation_members \
             SET last_read_msg_id = $3, last_read_msg_time = $4 \
             WHERE conversation_id = $1 AND user_id = $2 \
               AND (last_read_msg_time IS NULL OR last_read_msg_time <= $4)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(message_id)
        .bind(read_time)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Tear down a conversation: cascade-delete its rows, then clear every
    /// piece of derived Redis state (sequence counter, message cache,
    /// relation sets).
    pub async fn delete_conversation(&self, conversation_id: Uuid) -> AppResult<()> {
        let member_ids = ConversationService::delete_conversation(&self.db, conversation_id).await?;

        if let Err(e) = self.sequencer.reset(conversation_id).await {
            tracing::warn!(%conversation_id, error = %e, "sequence counter cleanup failed");
        }
        if let Err(e) = self.cache.invalidate(conversation_id).await {
            tracing::warn!(%conversation_id, error = %e, "message cache cleanup failed");
        }
        if let Err(e) = self.relations.invalidate(conversation_id, &member_ids).await {
            tracing::warn!(%conversation_id, error = %e, "relation cache cleanup failed");
        }
        Ok(())
    }

    /// Membership mutations go through here so the relation cache never
    /// outlives the rows it mirrors.
    pub async fn add_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        ConversationService::add_member(&self.db, conversation_id, user_id).await?;
        self.relations.invalidate(conversation_id, &[user_id]).await
    }

    pub async fn remove_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        ConversationService::remove_member(&self.db, conversation_id, user_id).await?;
        self.relations.invalidate(conversation_id, &[user_id]).await
    }

    async fn resolve_cursor(&self, cursor: Cursor) -> AppResult<StorePred> {
        // A cursor referencing a message that no longer exists is treated as
        // no anchor at all rather than an error.
        Ok(match cursor {
            Cursor::Latest => StorePred::None,
            Cursor::Before(id) => match self.created_at_of(id).await? {
                Some(t) => StorePred::Before(t),
                None => StorePred::None,
            },
            Cursor::After(id) => match self.created_at_of(id).await? {
                Some(t) => StorePred::After(t),
                None => StorePred::None,
            },
            Cursor::AfterSeq(seq) => StorePred::AfterSeq(seq),
        })
    }

    async fn created_at_of(&self, message_id: Uuid) -> AppResult<Option<DateTime<Utc>>> {
        Ok(
            sqlx::query_scalar("SELECT created_at FROM messages WHERE id = $1")
                .bind(message_id)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    async fn query_store(
        &self,
        conversation_id: Uuid,
        text: Option<&str>,
        pred: StorePred,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Message>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, conversation_id, sender_id, seq_id, client_msg_id, message_type, \
             content, duration_ms, thumbnail_url, is_revoked, created_at \
             FROM messages WHERE conversation_id = ",
        );
        qb.push_bind(conversation_id);
        if let Some(text) = text {
            qb.push(" AND content LIKE ");
            qb.push_bind(format!("%{text}%"));
        }
        let ascending = match pred {
            StorePred::None => false,
            StorePred::Before(t) => {
                qb.push(" AND created_at < ");
                qb.push_bind(t);
                false
            }
            StorePred::After(t) => {
                qb.push(" AND created_at > ");
                qb.push_bind(t);
                true
            }
            StorePred::AfterSeq(seq) => {
                qb.push(" AND seq_id > ");
                qb.push_bind(seq);
                true
            }
        };
        qb.push(if ascending {
            " ORDER BY created_at ASC"
        } else {
            " ORDER BY created_at DESC"
        });
        qb.push(" LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows = qb.build().fetch_all(&self.db).await?;
        let mut messages: Vec<Message> = rows
            .iter()
            .map(Message::from_row)
            .collect::<Result<_, _>>()?;
        // After-style queries run ascending so LIMIT picks the rows nearest
        // the anchor; reverse so callers always see a descending view.
        if ascending {
            messages.reverse();
        }
        Ok(messages)
    }
}
