//! Realtime connection health and manual recovery.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use tidings_common::types::ConnectionHealth;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/realtime/health", get(connection_health))
        .route("/api/realtime/refresh", post(force_refresh))
}

/// GET /api/realtime/health — Current push channel health.
async fn connection_health(State(state): State<AppState>) -> Json<ConnectionHealth> {
    Json(state.realtime.connection_health())
}

/// POST /api/realtime/refresh — Tear down and reconnect, resetting counters.
async fn force_refresh(State(state): State<AppState>) -> Json<ConnectionHealth> {
    state.realtime.force_refresh().await;
    Json(state.realtime.connection_health())
}
