use std::sync::Arc;

use chat_service::queue::MessageQueue;
use chat_service::redis_client::RedisClient;
use chat_service::services::flush_worker::FlushWorker;
use chat_service::{config, db, error, logging, migrations};

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let db = db::init_pool(&cfg.database_url).await?;
    migrations::run_all(&db).await?;

    let redis = RedisClient::from_url(&cfg.redis_url).await?;

    // Each worker gets its own consumer name within the shared group.
    let mut handles = Vec::with_capacity(cfg.queue.flush_workers);
    for _ in 0..cfg.queue.flush_workers {
        let queue = MessageQueue::new(
            redis.clone(),
            cfg.queue.stream_name.clone(),
            cfg.queue.group_name.clone(),
        );
        queue.ensure_group().await?;
        handles.push(FlushWorker::new(db.clone(), queue, &cfg.queue).spawn());
    }
    tracing::info!(workers = cfg.queue.flush_workers, "chat flush workers running");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| error::AppError::Config(format!("signal handler: {e}")))?;
    tracing::info!("shutting down; unacknowledged queue entries remain claimable");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
