//! Notification dispatcher — the public entry point for business events.
//!
//! For each request:
//! 1. Ask the batching guard whether an equivalent notification is inside its window
//! 2. Persist a fresh notification (bounded by the store timeout)
//! 3. Record delivery latency and outcome metrics
//!
//! Steps 1 and 2 run under a per-scope lock, so concurrent equivalent
//! requests in this process produce one row.
//!
//! Failures never propagate to the caller: `send` reports `false`, fan-out
//! reports how many recipients succeeded, maintenance reports `0`.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;

use tidings_common::config::DispatchConfig;
use tidings_common::types::{Notification, NotificationRequest, Recipient, RoleNotificationRequest};

use crate::batching::{BatchGuard, BatchScope, ScopeLocks, StoreBatchGuard};
use crate::resolver::RecipientResolver;
use crate::store::{NotificationStore, with_timeout};

/// Central dispatcher that turns business events into stored notifications.
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    guard: Arc<dyn BatchGuard>,
    resolver: Arc<dyn RecipientResolver>,
    config: DispatchConfig,
    scope_locks: ScopeLocks,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        guard: Arc<dyn BatchGuard>,
        resolver: Arc<dyn RecipientResolver>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            guard,
            resolver,
            config,
            scope_locks: ScopeLocks::new(),
        }
    }

    /// Dispatcher whose batching guard queries the same store it writes to.
    pub fn with_store_batching(
        store: Arc<dyn NotificationStore>,
        resolver: Arc<dyn RecipientResolver>,
        config: DispatchConfig,
    ) -> Self {
        let guard = Arc::new(StoreBatchGuard::new(store.clone()));
        Self::new(store, guard, resolver, config)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Notify a single recipient.
    ///
    /// Returns `true` when the event was acknowledged, either by persisting a
    /// new notification or by absorbing it into an open batching window.
    pub async fn send(&self, request: &NotificationRequest) -> bool {
        let started = Instant::now();

        if let Err(reason) = request.validate() {
            tracing::warn!(
                recipient_id = %request.recipient_id,
                kind = %request.kind,
                reason = %reason,
                "Rejected invalid notification request"
            );
            metrics::counter!("notifications_failed_total", "kind" => request.kind.clone())
                .increment(1);
            return false;
        }

        let scope = request
            .batch_key()
            .filter(|_| self.config.batching_enabled)
            .map(|batch_key| BatchScope {
                recipient_id: &request.recipient_id,
                kind: &request.kind,
                batch_key,
            });

        let _lease = match &scope {
            Some(scope) => Some(self.scope_locks.acquire(scope).await),
            None => None,
        };

        if let Some(scope) = &scope {
            match with_timeout(
                self.config.store_timeout,
                self.guard.should_suppress(scope, self.config.batch_window),
            )
            .await
            {
                Ok(true) => {
                    tracing::debug!(
                        recipient_id = %request.recipient_id,
                        kind = %request.kind,
                        batch_key = scope.batch_key,
                        "Notification batched"
                    );
                    metrics::counter!("notifications_batched_total", "kind" => request.kind.clone())
                        .increment(1);
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    // An unavailable guard must not cost a notification.
                    tracing::warn!(
                        error = %e,
                        kind = %request.kind,
                        "Batching check failed, sending without batching"
                    );
                }
            }
        }

        let notification = Notification::from_request(request);

        match with_timeout(self.config.store_timeout, self.store.insert(&notification)).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                metrics::histogram!(
                    "notification_dispatch_duration_seconds",
                    "kind" => request.kind.clone()
                )
                .record(elapsed.as_secs_f64());
                metrics::counter!("notifications_sent_total", "kind" => request.kind.clone())
                    .increment(1);

                tracing::info!(
                    notification_id = %notification.id,
                    recipient_id = %notification.recipient_id,
                    kind = %notification.kind,
                    priority = %notification.priority,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Notification created"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    recipient_id = %request.recipient_id,
                    kind = %request.kind,
                    "Failed to persist notification"
                );
                metrics::counter!("notifications_failed_total", "kind" => request.kind.clone())
                    .increment(1);

                if let Some(scope) = &scope
                    && let Err(e) = self.guard.release(scope).await
                {
                    tracing::warn!(error = %e, "Failed to release batching window");
                }
                false
            }
        }
    }

    /// Notify every active user holding one of `roles`.
    ///
    /// Sends run concurrently and independently; the result counts the
    /// recipients whose send reported success.
    pub async fn send_to_roles<R: AsRef<str>>(
        &self,
        roles: &[R],
        request: &RoleNotificationRequest,
    ) -> usize {
        let recipients = self.resolve_recipients(roles).await;
        if recipients.is_empty() {
            tracing::info!(kind = %request.kind, "No active recipients for roles");
            return 0;
        }

        let sends = recipients.iter().map(|recipient| {
            let addressed = request.for_recipient(recipient);
            async move { self.send(&addressed).await }
        });
        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();

        tracing::info!(
            kind = %request.kind,
            delivered,
            recipients = recipients.len(),
            "Role-based notifications sent"
        );
        delivered
    }

    /// Delete notifications older than `retention`. Safe to run concurrently
    /// with sends since it filters on the immutable `created_at`.
    pub async fn cleanup_old(&self, retention: Duration) -> u64 {
        let horizon = match chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        {
            Some(horizon) => horizon,
            None => {
                tracing::error!(retention_secs = retention.as_secs(), "Invalid retention period");
                return 0;
            }
        };

        match with_timeout(self.config.store_timeout, self.store.delete_older_than(horizon)).await {
            Ok(deleted) => {
                tracing::info!(deleted, horizon = %horizon, "Old notifications cleaned up");
                deleted
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to clean up old notifications");
                0
            }
        }
    }

    /// `cleanup_old` with the configured retention period.
    pub async fn cleanup_expired(&self) -> u64 {
        self.cleanup_old(self.config.retention).await
    }

    async fn resolve_recipients<R: AsRef<str>>(&self, roles: &[R]) -> Vec<Recipient> {
        let roles: Vec<String> = roles
            .iter()
            .map(|r| r.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if roles.is_empty() {
            return Vec::new();
        }

        match with_timeout(self.config.store_timeout, self.resolver.resolve(&roles)).await {
            Ok(recipients) => {
                let mut seen = HashSet::new();
                recipients
                    .into_iter()
                    .filter(|r| seen.insert(r.user_id.clone()))
                    .collect()
            }
            Err(e) => match &self.config.fallback_recipient {
                Some(user_id) => {
                    tracing::warn!(
                        error = %e,
                        fallback = %user_id,
                        "Recipient lookup failed, routing to fallback recipient"
                    );
                    vec![Recipient {
                        user_id: user_id.clone(),
                        role: "fallback".to_string(),
                        contact_address: None,
                    }]
                }
                None => {
                    tracing::error!(error = %e, ?roles, "Recipient lookup failed");
                    Vec::new()
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use uuid::Uuid;

    use tidings_common::error::StoreError;
    use tidings_common::types::{NotificationSummary, Priority, RECIPIENT_ROLE_KEY};

    use crate::resolver::StaticRecipientResolver;
    use crate::store::MemoryNotificationStore;

    fn dispatcher(store: Arc<MemoryNotificationStore>) -> NotificationDispatcher {
        let resolver = StaticRecipientResolver::new()
            .with_user("1", "Administrator", true)
            .with_user("2", "Sales Head", true)
            .with_user("3", "Sales Head", true)
            .with_user("4", "Sales Head", false)
            .with_user("5", "Sales Representative", true);
        NotificationDispatcher::with_store_batching(store, Arc::new(resolver), DispatchConfig::default())
    }

    fn quotation_created(recipient: &str) -> NotificationRequest {
        NotificationRequest::new(
            recipient,
            "quotation_created",
            "New Quotation Created",
            "Quotation #Q-1001 created for Acme",
            Priority::Medium,
        )
        .with_batch_key("quotation_created_Sun Oct 18 2026")
    }

    /// Store whose inserts fail for one recipient.
    struct FlakyStore {
        inner: MemoryNotificationStore,
        failing_recipient: String,
    }

    #[async_trait]
    impl NotificationStore for FlakyStore {
        async fn insert(&self, notification: &Notification) -> Result<(), StoreError> {
            if notification.recipient_id == self.failing_recipient {
                return Err(StoreError::Unavailable("write rejected".into()));
            }
            self.inner.insert(notification).await
        }
        async fn select_recent(
            &self,
            since: DateTime<Utc>,
            recipient_id: Option<&str>,
        ) -> Result<Vec<Notification>, StoreError> {
            self.inner.select_recent(since, recipient_id).await
        }
        async fn select_unread(
            &self,
            recipient_id: Option<&str>,
            limit: i64,
        ) -> Result<Vec<Notification>, StoreError> {
            self.inner.select_unread(recipient_id, limit).await
        }
        async fn delete_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.delete_older_than(horizon).await
        }
        async fn exists_in_window(
            &self,
            recipient_id: &str,
            kind: &str,
            batch_key: &str,
            since: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.exists_in_window(recipient_id, kind, batch_key, since).await
        }
        async fn mark_read(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.mark_read(id).await
        }
        async fn summarize(
            &self,
            recipient_id: Option<&str>,
        ) -> Result<Vec<NotificationSummary>, StoreError> {
            self.inner.summarize(recipient_id).await
        }
    }

    /// Store that yields to the scheduler before every call, like a networked one.
    #[derive(Default)]
    struct YieldingStore {
        inner: MemoryNotificationStore,
    }

    #[async_trait]
    impl NotificationStore for YieldingStore {
        async fn insert(&self, notification: &Notification) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.inner.insert(notification).await
        }
        async fn select_recent(
            &self,
            since: DateTime<Utc>,
            recipient_id: Option<&str>,
        ) -> Result<Vec<Notification>, StoreError> {
            tokio::task::yield_now().await;
            self.inner.select_recent(since, recipient_id).await
        }
        async fn select_unread(
            &self,
            recipient_id: Option<&str>,
            limit: i64,
        ) -> Result<Vec<Notification>, StoreError> {
            tokio::task::yield_now().await;
            self.inner.select_unread(recipient_id, limit).await
        }
        async fn delete_older_than(&self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
            tokio::task::yield_now().await;
            self.inner.delete_older_than(horizon).await
        }
        async fn exists_in_window(
            &self,
            recipient_id: &str,
            kind: &str,
            batch_key: &str,
            since: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.inner.exists_in_window(recipient_id, kind, batch_key, since).await
        }
        async fn mark_read(&self, id: Uuid) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.inner.mark_read(id).await
        }
        async fn summarize(
            &self,
            recipient_id: Option<&str>,
        ) -> Result<Vec<NotificationSummary>, StoreError> {
            tokio::task::yield_now().await;
            self.inner.summarize(recipient_id).await
        }
    }

    /// Store that never answers.
    struct HangingStore;

    #[async_trait]
    impl NotificationStore for HangingStore {
        async fn insert(&self, _: &Notification) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn select_recent(
            &self,
            _: DateTime<Utc>,
            _: Option<&str>,
        ) -> Result<Vec<Notification>, StoreError> {
            std::future::pending().await
        }
        async fn select_unread(&self, _: Option<&str>, _: i64) -> Result<Vec<Notification>, StoreError> {
            std::future::pending().await
        }
        async fn delete_older_than(&self, _: DateTime<Utc>) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn exists_in_window(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn mark_read(&self, _: Uuid) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn summarize(&self, _: Option<&str>) -> Result<Vec<NotificationSummary>, StoreError> {
            std::future::pending().await
        }
    }

    /// Resolver that always fails.
    struct BrokenResolver;

    #[async_trait]
    impl RecipientResolver for BrokenResolver {
        async fn resolve(&self, _: &[String]) -> Result<Vec<Recipient>, StoreError> {
            Err(StoreError::Unavailable("directory offline".into()))
        }
    }

    #[tokio::test]
    async fn test_batching_collapses_equivalent_requests() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());

        assert!(dispatcher.send(&quotation_created("1")).await);
        assert!(dispatcher.send(&quotation_created("1")).await);

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_equivalent_requests_store_one_row() {
        let store = Arc::new(YieldingStore::default());
        let dispatcher = NotificationDispatcher::with_store_batching(
            store.clone(),
            Arc::new(StaticRecipientResolver::new()),
            DispatchConfig::default(),
        );
        let request = quotation_created("1");

        let (first, second, third) = tokio::join!(
            dispatcher.send(&request),
            dispatcher.send(&request),
            dispatcher.send(&request)
        );

        assert!(first && second && third);
        assert_eq!(store.inner.len(), 1);
        assert!(dispatcher.scope_locks.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_with_different_keys_all_persist() {
        let store = Arc::new(YieldingStore::default());
        let dispatcher = NotificationDispatcher::with_store_batching(
            store.clone(),
            Arc::new(StaticRecipientResolver::new()),
            DispatchConfig::default(),
        );
        let monday = quotation_created("1").with_batch_key("quotation_created_Mon Oct 19 2026");

        let created = quotation_created("1");
        let (first, second) = tokio::join!(
            dispatcher.send(&created),
            dispatcher.send(&monday)
        );

        assert!(first && second);
        assert_eq!(store.inner.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_batching_persists_every_request() {
        let store = Arc::new(MemoryNotificationStore::new());
        let config = DispatchConfig {
            batching_enabled: false,
            ..DispatchConfig::default()
        };
        let dispatcher = NotificationDispatcher::with_store_batching(
            store.clone(),
            Arc::new(StaticRecipientResolver::new()),
            config,
        );

        assert!(dispatcher.send(&quotation_created("1")).await);
        assert!(dispatcher.send(&quotation_created("1")).await);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_second_row_after_window_expires() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());

        let mut earlier = Notification::from_request(&quotation_created("1"));
        earlier.created_at = Utc::now() - chrono::Duration::minutes(16);
        store.insert(&earlier).await.unwrap();

        assert!(dispatcher.send(&quotation_created("1")).await);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_different_batch_keys_or_recipients_are_not_merged() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());

        assert!(dispatcher.send(&quotation_created("1")).await);
        assert!(dispatcher.send(&quotation_created("2")).await);
        assert!(
            dispatcher
                .send(&quotation_created("1").with_batch_key("quotation_created_Mon Oct 19 2026"))
                .await
        );

        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_requests_without_batch_key_always_persist() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());
        let request = NotificationRequest::new("1", "payment_received", "Payment Received", "Paid", Priority::High);

        assert!(dispatcher.send(&request).await);
        assert!(dispatcher.send(&request).await);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_role_fan_out_creates_one_row_per_active_recipient() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());
        let request = RoleNotificationRequest::new(
            "quotation_created",
            "New Quotation Created",
            "Quotation #Q-1001 created",
            Priority::Medium,
        );

        let delivered = dispatcher
            .send_to_roles(&["Sales Head", "Administrator"], &request)
            .await;

        assert_eq!(delivered, 3);
        let rows = store.snapshot();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|n| n.metadata.get(RECIPIENT_ROLE_KEY).is_some()));
    }

    #[tokio::test]
    async fn test_role_fan_out_counts_only_successful_persists() {
        let store = Arc::new(FlakyStore {
            inner: MemoryNotificationStore::new(),
            failing_recipient: "2".to_string(),
        });
        let resolver = StaticRecipientResolver::new()
            .with_user("1", "Administrator", true)
            .with_user("2", "Sales Head", true)
            .with_user("3", "Sales Head", true);
        let dispatcher =
            NotificationDispatcher::with_store_batching(store.clone(), Arc::new(resolver), DispatchConfig::default());
        let request = RoleNotificationRequest::new("payment_received", "Payment", "Paid", Priority::High);

        let delivered = dispatcher
            .send_to_roles(&["Sales Head", "Administrator"], &request)
            .await;

        assert_eq!(delivered, 2);
        assert_eq!(store.inner.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_roles_deliver_nothing() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());
        let request = RoleNotificationRequest::new("payment_received", "Payment", "Paid", Priority::High);

        let roles: [&str; 0] = [];
        assert_eq!(dispatcher.send_to_roles(&roles, &request).await, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_resolver_failure_uses_fallback_recipient() {
        let store = Arc::new(MemoryNotificationStore::new());
        let config = DispatchConfig {
            fallback_recipient: Some("1".to_string()),
            ..DispatchConfig::default()
        };
        let dispatcher =
            NotificationDispatcher::with_store_batching(store.clone(), Arc::new(BrokenResolver), config);
        let request = RoleNotificationRequest::new("payment_received", "Payment", "Paid", Priority::High);

        assert_eq!(dispatcher.send_to_roles(&["Administrator"], &request).await, 1);
        assert_eq!(store.snapshot()[0].recipient_id, "1");
    }

    #[tokio::test]
    async fn test_resolver_failure_without_fallback_delivers_nothing() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = NotificationDispatcher::with_store_batching(
            store.clone(),
            Arc::new(BrokenResolver),
            DispatchConfig::default(),
        );
        let request = RoleNotificationRequest::new("payment_received", "Payment", "Paid", Priority::High);

        assert_eq!(dispatcher.send_to_roles(&["Administrator"], &request).await, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_returns_false() {
        let store = Arc::new(FlakyStore {
            inner: MemoryNotificationStore::new(),
            failing_recipient: "1".to_string(),
        });
        let dispatcher = NotificationDispatcher::with_store_batching(
            store,
            Arc::new(StaticRecipientResolver::new()),
            DispatchConfig::default(),
        );

        assert!(!dispatcher.send(&quotation_created("1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out_as_failure() {
        let store: Arc<dyn NotificationStore> = Arc::new(HangingStore);
        let guard = Arc::new(StoreBatchGuard::new(store.clone()));
        let dispatcher = NotificationDispatcher::new(
            store,
            guard,
            Arc::new(StaticRecipientResolver::new()),
            DispatchConfig::default(),
        );

        assert!(!dispatcher.send(&quotation_created("1")).await);
        assert_eq!(dispatcher.cleanup_old(Duration::from_secs(60)).await, 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());
        let request = NotificationRequest::new("1", "payment_received", "", "Paid", Priority::High);

        assert!(!dispatcher.send(&request).await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_rows_past_retention() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());

        let request = NotificationRequest::new("1", "followup_due", "Follow-up Due", "Call back", Priority::Medium);
        let mut stale = Notification::from_request(&request);
        stale.created_at = Utc::now() - chrono::Duration::days(40);
        let mut recent = Notification::from_request(&request);
        recent.created_at = Utc::now() - chrono::Duration::days(5);
        store.insert(&stale).await.unwrap();
        store.insert(&recent).await.unwrap();

        let deleted = dispatcher.cleanup_old(Duration::from_secs(30 * 24 * 60 * 60)).await;

        assert_eq!(deleted, 1);
        let remaining = store.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, recent.id);

        assert_eq!(dispatcher.cleanup_expired().await, 0);
    }

    #[tokio::test]
    async fn test_unrepresentable_retention_deletes_nothing() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());
        store
            .insert(&Notification::from_request(&quotation_created("1")))
            .await
            .unwrap();

        assert_eq!(dispatcher.cleanup_old(Duration::from_secs(u64::MAX)).await, 0);
        assert_eq!(
            dispatcher
                .cleanup_old(Duration::from_secs(400_000 * 365 * 24 * 60 * 60))
                .await,
            0
        );
        assert_eq!(store.len(), 1);
    }
}
