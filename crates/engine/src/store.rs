//! Notification store — durable, append-only notification log.
//!
//! Rows are never updated except for the read flag. Two backends share one
//! contract: `PgNotificationStore` for production and `MemoryNotificationStore`
//! for tests and embedders without a database.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

use tidings_common::error::StoreError;
use tidings_common::types::{Notification, NotificationSummary};

/// Persistence contract for notifications.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert one notification. Ids are never reused.
    async fn insert(&self, notification: &Notification) -> Result<(), StoreError>;

    /// Notifications created strictly after `since`, oldest first.
    async fn select_recent(
        &self,
        since: DateTime<Utc>,
        recipient_id: Option<&str>,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Unread notifications, newest first, at most `limit` rows.
    async fn select_unread(
        &self,
        recipient_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Delete notifications created before `horizon`. Returns the number deleted.
    async fn delete_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Whether a notification with the same recipient, kind and batch key was
    /// created after `since`.
    async fn exists_in_window(
        &self,
        recipient_id: &str,
        kind: &str,
        batch_key: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record a read receipt. Returns `false` when the notification does not exist.
    async fn mark_read(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Total and unread counts per recipient, ordered by recipient id.
    /// Recipients without notifications are absent.
    async fn summarize(
        &self,
        recipient_id: Option<&str>,
    ) -> Result<Vec<NotificationSummary>, StoreError>;
}

/// Run a store future with an upper bound; an elapsed bound is a failure.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, recipient_id, kind, title, body, priority, is_read, created_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(notification.id)
        .bind(&notification.recipient_id)
        .bind(&notification.kind)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.priority.to_string())
        .bind(notification.is_read)
        .bind(notification.created_at)
        .bind(&notification.metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn select_recent(
        &self,
        since: DateTime<Utc>,
        recipient_id: Option<&str>,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT id, recipient_id, kind, title, body, priority, is_read, created_at, metadata
            FROM notifications
            WHERE created_at > $1
              AND ($2::text IS NULL OR recipient_id = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(since)
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn select_unread(
        &self,
        recipient_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT id, recipient_id, kind, title, body, priority, is_read, created_at, metadata
            FROM notifications
            WHERE is_read = FALSE
              AND ($1::text IS NULL OR recipient_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(recipient_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn delete_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM notifications WHERE created_at < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn exists_in_window(
        &self,
        recipient_id: &str,
        kind: &str,
        batch_key: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM notifications
                WHERE recipient_id = $1
                  AND kind = $2
                  AND metadata->>'batch_key' = $3
                  AND created_at > $4
            )
            "#,
        )
        .bind(recipient_id)
        .bind(kind)
        .bind(batch_key)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn mark_read(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn summarize(
        &self,
        recipient_id: Option<&str>,
    ) -> Result<Vec<NotificationSummary>, StoreError> {
        let rows: Vec<NotificationSummary> = sqlx::query_as(
            r#"
            SELECT recipient_id,
                   COUNT(*)::BIGINT AS total,
                   COUNT(*) FILTER (WHERE is_read = FALSE)::BIGINT AS unread,
                   MAX(created_at) AS latest_at
            FROM notifications
            WHERE ($1::text IS NULL OR recipient_id = $1)
            GROUP BY recipient_id
            ORDER BY recipient_id
            "#,
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// In-process store with the same semantics as the PostgreSQL backend.
#[derive(Default)]
pub struct MemoryNotificationStore {
    rows: Mutex<Vec<Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored row, in insertion order.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        if rows.iter().any(|n| n.id == notification.id) {
            return Err(StoreError::Unavailable(format!(
                "duplicate notification id {}",
                notification.id
            )));
        }
        rows.push(notification.clone());
        Ok(())
    }

    async fn select_recent(
        &self,
        since: DateTime<Utc>,
        recipient_id: Option<&str>,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut recent: Vec<Notification> = self
            .rows
            .lock()
            .iter()
            .filter(|n| n.created_at > since)
            .filter(|n| recipient_id.is_none_or(|r| n.recipient_id == r))
            .cloned()
            .collect();
        recent.sort_by_key(|n| n.created_at);
        Ok(recent)
    }

    async fn select_unread(
        &self,
        recipient_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut unread: Vec<Notification> = self
            .rows
            .lock()
            .iter()
            .filter(|n| !n.is_read)
            .filter(|n| recipient_id.is_none_or(|r| n.recipient_id == r))
            .cloned()
            .collect();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        unread.truncate(limit.max(0) as usize);
        Ok(unread)
    }

    async fn delete_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|n| n.created_at >= horizon);
        Ok((before - rows.len()) as u64)
    }

    async fn exists_in_window(
        &self,
        recipient_id: &str,
        kind: &str,
        batch_key: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.rows.lock().iter().any(|n| {
            n.recipient_id == recipient_id
                && n.kind == kind
                && n.batch_key() == Some(batch_key)
                && n.created_at > since
        }))
    }

    async fn mark_read(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|n| n.id == id) {
            Some(row) => {
                row.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn summarize(
        &self,
        recipient_id: Option<&str>,
    ) -> Result<Vec<NotificationSummary>, StoreError> {
        let mut summaries: BTreeMap<String, NotificationSummary> = BTreeMap::new();
        for n in self
            .rows
            .lock()
            .iter()
            .filter(|n| recipient_id.is_none_or(|r| n.recipient_id == r))
        {
            let summary = summaries
                .entry(n.recipient_id.clone())
                .or_insert_with(|| NotificationSummary {
                    recipient_id: n.recipient_id.clone(),
                    total: 0,
                    unread: 0,
                    latest_at: n.created_at,
                });
            summary.total += 1;
            if !n.is_read {
                summary.unread += 1;
            }
            summary.latest_at = summary.latest_at.max(n.created_at);
        }
        Ok(summaries.into_values().collect())
    }
}
