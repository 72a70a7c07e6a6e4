//! Notification dispatch, unread listing, read receipts, stats and retention.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use tidings_common::config::{MAX_RETENTION_DAYS, retention_days};
use tidings_common::error::AppError;
use tidings_common::types::{
    Notification, NotificationRequest, NotificationSummary, RoleNotificationRequest,
};
use tidings_engine::store::with_timeout;

use crate::state::AppState;

const DEFAULT_UNREAD_LIMIT: i64 = 10;
const MAX_UNREAD_LIMIT: i64 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(send_notification))
        .route("/api/notifications/roles", post(send_to_roles))
        .route("/api/notifications/unread", get(list_unread))
        .route("/api/notifications/stats", get(stats))
        .route("/api/notifications/cleanup", post(cleanup))
        .route("/api/notifications/{id}/read", post(mark_read))
}

/// Body of `POST /api/notifications/roles`.
#[derive(Debug, Deserialize)]
pub struct RoleDispatchParams {
    pub roles: Vec<String>,
    #[serde(flatten)]
    pub notification: RoleNotificationRequest,
}

#[derive(Debug, Deserialize)]
pub struct UnreadQuery {
    pub recipient_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub recipient_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub retention_days: Option<u64>,
}

/// POST /api/notifications — Notify a single recipient.
///
/// A batched request reports success just like a stored one.
async fn send_notification(
    State(state): State<AppState>,
    Json(request): Json<NotificationRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    request.validate().map_err(AppError::Validation)?;
    let success = state.dispatcher.send(&request).await;
    Ok(Json(json!({ "success": success })))
}

/// POST /api/notifications/roles — Fan out to every active user in the roles.
async fn send_to_roles(
    State(state): State<AppState>,
    Json(params): Json<RoleDispatchParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let notification = &params.notification;
    if notification.title.trim().is_empty() || notification.body.trim().is_empty() {
        return Err(AppError::Validation(
            "title and body must not be empty".to_string(),
        ));
    }

    let delivered = state
        .dispatcher
        .send_to_roles(&params.roles, notification)
        .await;
    Ok(Json(json!({ "delivered": delivered })))
}

/// GET /api/notifications/unread — Newest unread notifications.
async fn list_unread(
    State(state): State<AppState>,
    Query(query): Query<UnreadQuery>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_UNREAD_LIMIT);
    if !(1..=MAX_UNREAD_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_UNREAD_LIMIT
        )));
    }

    let rows = with_timeout(
        state.dispatcher.config().store_timeout,
        state.store.select_unread(query.recipient_id.as_deref(), limit),
    )
    .await?;
    Ok(Json(rows))
}

/// GET /api/notifications/stats — Total and unread counts per recipient.
async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<NotificationSummary>>, AppError> {
    let summaries = with_timeout(
        state.dispatcher.config().store_timeout,
        state.store.summarize(query.recipient_id.as_deref()),
    )
    .await?;
    Ok(Json(summaries))
}

/// POST /api/notifications/:id/read — Record a read receipt.
async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let found = with_timeout(
        state.dispatcher.config().store_timeout,
        state.store.mark_read(id),
    )
    .await?;

    if found {
        Ok(Json(json!({ "read": true })))
    } else {
        Err(AppError::NotFound(format!("Notification {} not found", id)))
    }
}

/// POST /api/notifications/cleanup — Run the retention sweep now.
async fn cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let retention = match query.retention_days {
        Some(0) => {
            return Err(AppError::Validation(
                "retention_days must be at least 1".to_string(),
            ));
        }
        Some(days) => retention_days(days).ok_or_else(|| {
            AppError::Validation(format!(
                "retention_days must not exceed {}",
                MAX_RETENTION_DAYS
            ))
        })?,
        None => state.dispatcher.config().retention,
    };

    let deleted = state.dispatcher.cleanup_old(retention).await;
    Ok(Json(json!({ "deleted": deleted })))
}
