//! Tidings notification service binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tidings_common::config::{AppConfig, BatchBackend};
use tidings_common::db::{create_pool, run_migrations};
use tidings_common::redis_pool::create_redis_pool;
use tidings_engine::batching::{BatchGuard, RedisBatchGuard, StoreBatchGuard};
use tidings_engine::dispatcher::NotificationDispatcher;
use tidings_engine::resolver::PgRecipientResolver;
use tidings_engine::store::{NotificationStore, PgNotificationStore};
use tidings_realtime::{PgPushChannel, RealtimeManager};

use tidings_api::routes::create_router;
use tidings_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("tidings_api=info,tidings_engine=info,tidings_realtime=info")
        }))
        .json()
        .init();

    tracing::info!("Starting Tidings notification service...");

    let config = AppConfig::from_env()?;

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let pool = create_pool(
        &config.database_url,
        config.db_max_connections,
        config.dispatch.store_timeout,
    )
    .await?;
    run_migrations(&pool).await?;

    let store: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(pool.clone()));
    let resolver = Arc::new(PgRecipientResolver::new(pool.clone()));

    let guard: Arc<dyn BatchGuard> = match config.dispatch.batch_backend {
        BatchBackend::Store => Arc::new(StoreBatchGuard::new(store.clone())),
        BatchBackend::Redis => {
            let redis_url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("REDIS_URL is required for the redis batch backend"))?;
            Arc::new(RedisBatchGuard::new(create_redis_pool(redis_url).await?))
        }
    };
    tracing::info!(backend = ?config.dispatch.batch_backend, "Batching guard ready");

    let dispatcher = Arc::new(NotificationDispatcher::new(
        store.clone(),
        guard,
        resolver,
        config.dispatch.clone(),
    ));

    let realtime = RealtimeManager::new(
        config.realtime.clone(),
        Arc::new(PgPushChannel::new(pool.clone())),
        store.clone(),
    );
    realtime.add_notification_callback(|change| {
        tracing::info!(event_type = change.event_type(), "Notification change observed");
        Ok(())
    });
    realtime.add_status_callback(|event| {
        tracing::info!(
            status = %event.status,
            fallback_active = event.fallback_active,
            error = ?event.error,
            "Realtime connection status changed"
        );
        Ok(())
    });
    realtime.initialize();

    let sweeper = spawn_retention_sweeper(dispatcher.clone(), config.dispatch.cleanup_interval);

    let state = AppState::new(store, dispatcher, realtime.clone()).with_metrics(metrics);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    realtime.cleanup().await;

    tracing::info!("Tidings notification service stopped.");
    Ok(())
}

/// Periodically delete notifications past the retention period.
fn spawn_retention_sweeper(
    dispatcher: Arc<NotificationDispatcher>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let deleted = dispatcher.cleanup_expired().await;
            tracing::debug!(deleted, "Retention sweep finished");
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal, stopping gracefully...");
}
