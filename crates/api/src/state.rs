//! Shared application state for the Axum API server.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use tidings_engine::dispatcher::NotificationDispatcher;
use tidings_engine::store::NotificationStore;
use tidings_realtime::RealtimeManager;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn NotificationStore>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub realtime: RealtimeManager,
    /// Prometheus recorder handle; `None` when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        dispatcher: Arc<NotificationDispatcher>,
        realtime: RealtimeManager,
    ) -> Self {
        Self {
            store,
            dispatcher,
            realtime,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
