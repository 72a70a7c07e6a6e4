use redis::Client;
use redis::aio::ConnectionManager;

/// Open a self-reconnecting Redis connection for the batching guard.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis for notification batching");
    Ok(manager)
}
