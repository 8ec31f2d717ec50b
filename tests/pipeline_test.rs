//! End-to-end pipeline tests against real Postgres and Redis.
//!
//! These run only when DATABASE_URL and REDIS_URL are set; otherwise each
//! test prints a skip notice and returns. Every test isolates itself with
//! fresh conversation ids and a unique stream/group pair.

use std::sync::Arc;

use chat_service::config::{CacheConfig, Config, QueueConfig};
use chat_service::models::{ConversationType, MessageKind};
use chat_service::queue::MessageQueue;
use chat_service::redis_client::RedisClient;
use chat_service::services::conversation_service::ConversationService;
use chat_service::services::flush_worker::{flush, FlushWorker};
use chat_service::services::message_service::{
    Cursor, HistoryQuery, MessageService, NewMessage,
};
use chat_service::services::sequencer::Sequencer;
use chat_service::services::visibility::VisibilityManager;
use chat_service::{error::AppError, migrations};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

/// Postgres truncates timestamptz to microseconds, so timestamps that round-trip
/// through the store can differ from their in-memory originals by sub-microsecond
/// noise.
fn same_instant(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_microseconds().map_or(false, |d| d.abs() <= 1)
}

struct TestCtx {
    db: Pool<Postgres>,
    redis: RedisClient,
    config: Arc<Config>,
    service: MessageService,
}

fn test_config(database_url: String, redis_url: String, queue_enabled: bool) -> Config {
    let run_id = Uuid::new_v4();
    Config {
        database_url,
        redis_url,
        queue: QueueConfig {
            enabled: queue_enabled,
            stream_name: format!("test:chat:stream:{run_id}"),
            group_name: format!("test:chat:group:{run_id}"),
            flush_batch_size: 100,
            flush_block_ms: 100,
            flush_poll_interval_ms: 10,
            flush_reclaim_idle_ms: 100,
            flush_workers: 1,
        },
        cache: CacheConfig {
            capacity: 50,
            ttl_secs: 300,
        },
        relation_ttl_secs: 300,
        revoke_window_secs: 120,
    }
}

async fn setup(queue_enabled: bool) -> Option<TestCtx> {
    let (Ok(database_url), Ok(redis_url)) =
        (std::env::var("DATABASE_URL"), std::env::var("REDIS_URL"))
    else {
        eprintln!("skipping: DATABASE_URL / REDIS_URL not set");
        return None;
    };

    let db = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("connect postgres");
    migrations::run_all(&db).await.expect("migrations");

    let redis = RedisClient::from_url(&redis_url).await.expect("connect redis");
    let config = Arc::new(test_config(database_url, redis_url, queue_enabled));
    let service = MessageService::new(db.clone(), redis.clone(), config.clone());
    Some(TestCtx {
        db,
        redis,
        config,
        service,
    })
}

async fn create_user(db: &Pool<Postgres>, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(name)
        .execute(db)
        .await
        .expect("insert user");
    id
}

async fn create_conversation(db: &Pool<Postgres>, members: &[Uuid]) -> Uuid {
    ConversationService::create_conversation(db, ConversationType::Group, "study group", None, members)
        .await
        .expect("create conversation")
}

fn worker(ctx: &TestCtx) -> FlushWorker {
    let queue = MessageQueue::new(
        ctx.redis.clone(),
        ctx.config.queue.stream_name.clone(),
        ctx.config.queue.group_name.clone(),
    );
    FlushWorker::new(ctx.db.clone(), queue, &ctx.config.queue)
}

async fn drain(ctx: &TestCtx, expected: usize) {
    let worker = worker(ctx);
    let mut flushed = 0;
    for _ in 0..50 {
        flushed += worker.tick().await.expect("tick");
        if flushed >= expected {
            return;
        }
    }
    panic!("expected {expected} messages flushed, got {flushed}");
}

async fn ensure_group(ctx: &TestCtx) {
    MessageQueue::new(
        ctx.redis.clone(),
        ctx.config.queue.stream_name.clone(),
        ctx.config.queue.group_name.clone(),
    )
    .ensure_group()
    .await
    .expect("ensure group");
}

#[tokio::test]
async fn primary_path_flushes_in_order_and_touches_recency() {
    let Some(ctx) = setup(true).await else { return };
    ensure_group(&ctx).await;

    let alice = create_user(&ctx.db, "alice").await;
    let bob = create_user(&ctx.db, "bob").await;
    let conv = create_conversation(&ctx.db, &[alice, bob]).await;

    let m1 = ctx
        .service
        .send_message(NewMessage::text(conv, alice, "hi"))
        .await
        .expect("send hi");
    let m2 = ctx
        .service
        .send_message(NewMessage::text(conv, alice, "there"))
        .await
        .expect("send there");
    assert!(m2.seq_id > m1.seq_id, "seq ids must be strictly increasing");

    drain(&ctx, 2).await;

    let page = ctx
        .service
        .list_messages(conv, bob, &HistoryQuery::latest(10))
        .await
        .expect("list");
    let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["there", "hi"]);

    let updated_at: DateTime<Utc> =
        sqlx::query_scalar("SELECT updated_at FROM conversations WHERE id = $1")
            .bind(conv)
            .fetch_one(&ctx.db)
            .await
            .expect("updated_at");
    assert!(same_instant(updated_at, m2.created_at));
}

#[tokio::test]
async fn fallback_path_is_synchronous_and_atomic() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    let msg = ctx
        .service
        .send_message(NewMessage::text(conv, alice, "direct"))
        .await
        .expect("send");

    // No worker involved: the row must already be there.
    let page = ctx
        .service
        .list_messages(conv, alice, &HistoryQuery::latest(10))
        .await
        .expect("list");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, msg.id);

    let updated_at: DateTime<Utc> =
        sqlx::query_scalar("SELECT updated_at FROM conversations WHERE id = $1")
            .bind(conv)
            .fetch_one(&ctx.db)
            .await
            .expect("updated_at");
    assert!(same_instant(updated_at, msg.created_at));
}

#[tokio::test]
async fn non_member_cannot_send_or_read() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let outsider = create_user(&ctx.db, "mallory").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    let send = ctx
        .service
        .send_message(NewMessage::text(conv, outsider, "let me in"))
        .await;
    assert!(matches!(send, Err(AppError::NotAMember)));

    let read = ctx
        .service
        .list_messages(conv, outsider, &HistoryQuery::latest(10))
        .await;
    assert!(matches!(read, Err(AppError::NotAMember)));
}

#[tokio::test]
async fn visibility_clears_on_new_message_for_both_paths() {
    for queue_enabled in [true, false] {
        let Some(ctx) = setup(queue_enabled).await else { return };
        if queue_enabled {
            ensure_group(&ctx).await;
        }

        let alice = create_user(&ctx.db, "alice").await;
        let bob = create_user(&ctx.db, "bob").await;
        let conv = create_conversation(&ctx.db, &[alice, bob]).await;

        VisibilityManager::hide(&ctx.db, conv, bob).await.expect("hide");
        let member = ConversationService::get_member(&ctx.db, conv, bob)
            .await
            .expect("member");
        assert!(member.hidden_at.is_some());

        ctx.service
            .send_message(NewMessage::text(conv, alice, "ping"))
            .await
            .expect("send");

        // The clear is fire-and-forget; poll briefly.
        let mut cleared = false;
        for _ in 0..100 {
            let member = ConversationService::get_member(&ctx.db, conv, bob)
                .await
                .expect("member");
            if member.hidden_at.is_none() {
                cleared = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(cleared, "hidden_at was not auto-cleared (queue_enabled={queue_enabled})");
    }
}

#[tokio::test]
async fn cache_converges_with_store_on_freshest_page() {
    let Some(ctx) = setup(true).await else { return };
    ensure_group(&ctx).await;

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    let sent = ctx
        .service
        .send_message(NewMessage::text(conv, alice, "freshest"))
        .await
        .expect("send");
    drain(&ctx, 1).await;

    let mut converged = false;
    for _ in 0..100 {
        let page = ctx
            .service
            .list_messages(conv, alice, &HistoryQuery::latest(1))
            .await
            .expect("list");
        if page.first().map(|m| m.id) == Some(sent.id) {
            converged = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(converged, "cache and store never agreed on the freshest message");
}

#[tokio::test]
async fn pagination_never_skips_or_repeats() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    for i in 0..25 {
        ctx.service
            .send_message(NewMessage::text(conv, alice, format!("msg-{i}")))
            .await
            .expect("send");
    }

    let full = ctx
        .service
        .list_messages(conv, alice, &HistoryQuery::latest(200))
        .await
        .expect("full scan");
    assert_eq!(full.len(), 25);

    let mut paged = Vec::new();
    let mut cursor = Cursor::Latest;
    loop {
        let page = ctx
            .service
            .list_messages(
                conv,
                alice,
                &HistoryQuery {
                    cursor,
                    ..HistoryQuery::latest(10)
                },
            )
            .await
            .expect("page");
        if page.is_empty() {
            break;
        }
        cursor = Cursor::Before(page.last().unwrap().id);
        paged.extend(page);
    }

    let full_ids: Vec<Uuid> = full.iter().map(|m| m.id).collect();
    let paged_ids: Vec<Uuid> = paged.iter().map(|m| m.id).collect();
    assert_eq!(paged_ids, full_ids);
}

#[tokio::test]
async fn after_seq_returns_only_newer_rows_descending() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    let mut seqs = Vec::new();
    for i in 0..5 {
        let m = ctx
            .service
            .send_message(NewMessage::text(conv, alice, format!("m{i}")))
            .await
            .expect("send");
        seqs.push(m.seq_id);
    }
    let anchor = seqs[2];

    let page = ctx
        .service
        .list_messages(
            conv,
            alice,
            &HistoryQuery {
                cursor: Cursor::AfterSeq(anchor),
                ..HistoryQuery::latest(10)
            },
        )
        .await
        .expect("gap repair");
    assert_eq!(page.len(), 2);
    assert!(page.iter().all(|m| m.seq_id > anchor));
    assert!(page[0].created_at > page[1].created_at);
}

#[tokio::test]
async fn stranded_pending_batch_is_reclaimed_and_persisted() {
    let Some(ctx) = setup(true).await else { return };
    ensure_group(&ctx).await;

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    for i in 0..3 {
        ctx.service
            .send_message(NewMessage::text(conv, alice, format!("stranded-{i}")))
            .await
            .expect("send");
    }

    // A consumer claims the batch and dies without acking or flushing.
    let casualty = MessageQueue::new(
        ctx.redis.clone(),
        ctx.config.queue.stream_name.clone(),
        ctx.config.queue.group_name.clone(),
    );
    let claimed = casualty.claim(10, 100).await.expect("claim");
    assert_eq!(claimed.len(), 3);
    drop(casualty);

    // Once the entries pass the idle threshold a live worker takes them over.
    tokio::time::sleep(std::time::Duration::from_millis(
        ctx.config.queue.flush_reclaim_idle_ms + 50,
    ))
    .await;
    drain(&ctx, 3).await;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
        .bind(conv)
        .fetch_one(&ctx.db)
        .await
        .expect("count");
    assert_eq!(count, 3);
}

#[tokio::test]
async fn reflushing_a_batch_is_idempotent() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    let batch: Vec<_> = {
        let mut out = Vec::new();
        for i in 0..3 {
            let mut m = ctx
                .service
                .send_message(NewMessage::text(conv, alice, format!("b{i}")))
                .await
                .expect("send");
            m.sender = None;
            out.push(m);
        }
        out
    };

    // Simulate crash-after-flush-before-ack: the same rows arrive again.
    flush(&ctx.db, &batch).await.expect("reflush");

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
        .bind(conv)
        .fetch_one(&ctx.db)
        .await
        .expect("count");
    assert_eq!(count, 3);
}

#[tokio::test]
async fn revoke_respects_sender_and_window() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let bob = create_user(&ctx.db, "bob").await;
    let conv = create_conversation(&ctx.db, &[alice, bob]).await;

    let msg = ctx
        .service
        .send_message(NewMessage::text(conv, alice, "oops"))
        .await
        .expect("send");

    let not_sender = ctx.service.revoke_message(msg.id, bob).await;
    assert!(matches!(not_sender, Err(AppError::Forbidden)));

    let revoked = ctx
        .service
        .revoke_message(msg.id, alice)
        .await
        .expect("revoke");
    assert!(revoked.is_revoked);
    assert_ne!(revoked.content, "oops");
    assert_eq!(revoked.id, msg.id);
    assert_eq!(revoked.seq_id, msg.seq_id);
    assert!(same_instant(revoked.created_at, msg.created_at));

    // An old message is past the window.
    let mut stale = msg.clone();
    stale.id = Uuid::new_v4();
    stale.is_revoked = false;
    stale.content = "ancient".into();
    stale.created_at = Utc::now() - Duration::seconds(ctx.config.revoke_window_secs + 60);
    stale.sender = None;
    flush(&ctx.db, std::slice::from_ref(&stale)).await.expect("insert stale");
    let expired = ctx.service.revoke_message(stale.id, alice).await;
    assert!(matches!(expired, Err(AppError::RevokeWindowExpired { .. })));
}

#[tokio::test]
async fn mark_read_never_regresses() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    let m1 = ctx
        .service
        .send_message(NewMessage::text(conv, alice, "first"))
        .await
        .expect("send");
    let m2 = ctx
        .service
        .send_message(NewMessage::text(conv, alice, "second"))
        .await
        .expect("send");

    ctx.service.mark_read(conv, alice, m2.id).await.expect("read m2");
    ctx.service.mark_read(conv, alice, m1.id).await.expect("read m1");

    let member = ConversationService::get_member(&ctx.db, conv, alice)
        .await
        .expect("member");
    assert_eq!(member.last_read_msg_id, Some(m2.id));
    let read_time = member.last_read_msg_time.expect("read time set");
    assert!(same_instant(read_time, m2.created_at));
}

#[tokio::test]
async fn sequencer_is_strictly_increasing_under_concurrency() {
    let Some(ctx) = setup(true).await else { return };

    let conv = Uuid::new_v4();
    let sequencer = Sequencer::new(ctx.redis.clone());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let sequencer = sequencer.clone();
        handles.push(tokio::spawn(async move { sequencer.next_seq(conv).await }));
    }
    let mut seqs = Vec::new();
    for h in handles {
        seqs.push(h.await.expect("join"));
    }
    let unique: std::collections::HashSet<i64> = seqs.iter().copied().collect();
    assert_eq!(unique.len(), 20, "no two callers may observe the same seq");
    assert!(seqs.iter().all(|s| *s > 0));

    sequencer.reset(conv).await.expect("reset");
}

#[tokio::test]
async fn delete_conversation_cascades() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;
    ctx.service
        .send_message(NewMessage::text(conv, alice, "doomed"))
        .await
        .expect("send");

    ctx.service.delete_conversation(conv).await.expect("delete");

    for table in ["messages", "conversation_members"] {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE conversation_id = $1"
        ))
        .bind(conv)
        .fetch_one(&ctx.db)
        .await
        .expect("count");
        assert_eq!(count, 0, "{table} rows not cascaded");
    }
    let convs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE id = $1")
        .bind(conv)
        .fetch_one(&ctx.db)
        .await
        .expect("count");
    assert_eq!(convs, 0);
}

#[tokio::test]
async fn system_messages_have_no_sender_and_still_unhide() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    let msg = ctx
        .service
        .send_system_message(conv, "alice created the group")
        .await
        .expect("system send");
    assert!(msg.sender_id.is_none());
    assert_eq!(msg.kind, MessageKind::System);

    let page = ctx
        .service
        .list_messages(conv, alice, &HistoryQuery::latest(5))
        .await
        .expect("list");
    assert_eq!(page[0].id, msg.id);
}

#[tokio::test]
async fn text_filter_bypasses_cache_and_matches_substring() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    for content in ["pointers are hard", "recursion", "dangling pointer"] {
        ctx.service
            .send_message(NewMessage::text(conv, alice, content))
            .await
            .expect("send");
    }

    let page = ctx
        .service
        .list_messages(
            conv,
            alice,
            &HistoryQuery {
                text: Some("pointer".into()),
                ..HistoryQuery::latest(10)
            },
        )
        .await
        .expect("filtered list");
    assert_eq!(page.len(), 2);
    assert!(page.iter().all(|m| m.content.contains("pointer")));

    // Row membership check helper stays consistent with the relation cache.
    let members = ctx.service.relations().member_ids(conv).await.expect("members");
    assert_eq!(members, vec![alice]);
}

#[tokio::test]
async fn blank_text_messages_are_rejected() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    for content in ["", "   ", "\n\t"] {
        let sent = ctx
            .service
            .send_message(NewMessage::text(conv, alice, content))
            .await;
        assert!(matches!(sent, Err(AppError::BadRequest(_))), "{content:?} accepted");
    }

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
        .bind(conv)
        .fetch_one(&ctx.db)
        .await
        .expect("count");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn conversation_list_tracks_visibility_and_recency() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let c1 = create_conversation(&ctx.db, &[alice]).await;
    let c2 = create_conversation(&ctx.db, &[alice]).await;

    ctx.service
        .send_message(NewMessage::text(c1, alice, "in c1"))
        .await
        .expect("send c1");
    ctx.service
        .send_message(NewMessage::text(c2, alice, "in c2"))
        .await
        .expect("send c2");

    let ids = |convs: Vec<chat_service::models::Conversation>| -> Vec<Uuid> {
        convs.into_iter().map(|c| c.id).collect()
    };

    let listed = ConversationService::list_for_user(&ctx.db, alice)
        .await
        .expect("list");
    assert_eq!(ids(listed), vec![c2, c1]);

    VisibilityManager::hide(&ctx.db, c1, alice).await.expect("hide");
    let listed = ConversationService::list_for_user(&ctx.db, alice)
        .await
        .expect("list");
    assert_eq!(ids(listed), vec![c2]);

    // A new message un-hides c1 and makes it the most recent again.
    ctx.service
        .send_message(NewMessage::text(c1, alice, "back in c1"))
        .await
        .expect("send c1 again");
    let mut reappeared = false;
    for _ in 0..100 {
        let listed = ConversationService::list_for_user(&ctx.db, alice)
            .await
            .expect("list");
        if ids(listed) == vec![c1, c2] {
            reappeared = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(reappeared, "hidden conversation did not resurface at the top");
}

#[tokio::test]
async fn membership_mutations_invalidate_the_relation_cache() {
    let Some(ctx) = setup(false).await else { return };

    let alice = create_user(&ctx.db, "alice").await;
    let bob = create_user(&ctx.db, "bob").await;
    let conv = create_conversation(&ctx.db, &[alice]).await;

    // Prime the cached member set, then mutate membership through the service.
    let members = ctx.service.relations().member_ids(conv).await.expect("members");
    assert_eq!(members, vec![alice]);

    ctx.service.add_member(conv, bob).await.expect("add member");
    let mut members = ctx.service.relations().member_ids(conv).await.expect("members");
    members.sort();
    let mut expected = vec![alice, bob];
    expected.sort();
    assert_eq!(members, expected);

    ctx.service.remove_member(conv, bob).await.expect("remove member");
    let members = ctx.service.relations().member_ids(conv).await.expect("members");
    assert_eq!(members, vec![alice]);

    // The removed user's own conversation set was dropped as well.
    let convs = ctx.service.relations().conversation_ids(bob).await.expect("convs");
    assert!(!convs.contains(&conv));
}
