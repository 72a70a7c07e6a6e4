//! Batching guard — at-most-one notification per window.
//!
//! Once a notification with a given `(recipient_id, kind, batch_key)` has been
//! emitted, equivalent ones inside the batching window are suppressed. This is
//! window suppression, not content deduplication: different batch keys for the
//! same kind and recipient are never merged.
//!
//! The store-backed guard asks the notification log; the Redis guard uses
//! `SET NX EX` for an atomic check-and-set with automatic TTL expiry.
//! Within one process, [`ScopeLocks`] makes equivalent sends check and
//! persist one at a time, so the store-backed guard sees its predecessor's row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use tidings_common::error::StoreError;

use crate::store::NotificationStore;

/// The identity a batching window is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchScope<'a> {
    pub recipient_id: &'a str,
    pub kind: &'a str,
    pub batch_key: &'a str,
}

impl BatchScope<'_> {
    fn lock_key(&self) -> String {
        format!("{}\u{1f}{}\u{1f}{}", self.recipient_id, self.kind, self.batch_key)
    }
}

/// One async lock per live batching scope. Entries are dropped as soon as
/// nobody holds or waits for them.
#[derive(Default)]
pub struct ScopeLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other holder of `scope` is between check and persist.
    pub async fn acquire(&self, scope: &BatchScope<'_>) -> ScopeLease<'_> {
        let key = scope.lock_key();
        let entry = self.locks.lock().entry(key.clone()).or_default().clone();
        let guard = entry.lock_owned().await;
        ScopeLease {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of scopes currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// Held for the duration of one check-and-persist.
pub struct ScopeLease<'a> {
    locks: &'a ScopeLocks,
    key: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for ScopeLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Decides whether a candidate notification should be suppressed.
#[async_trait]
pub trait BatchGuard: Send + Sync {
    /// Returns `true` if an equivalent notification was already emitted inside
    /// `window` and the candidate should be absorbed.
    async fn should_suppress(
        &self,
        scope: &BatchScope<'_>,
        window: Duration,
    ) -> Result<bool, StoreError>;

    /// Forget a window opened by a candidate that then failed to persist.
    async fn release(&self, _scope: &BatchScope<'_>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Guard that consults the notification store.
pub struct StoreBatchGuard {
    store: Arc<dyn NotificationStore>,
}

impl StoreBatchGuard {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchGuard for StoreBatchGuard {
    async fn should_suppress(
        &self,
        scope: &BatchScope<'_>,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| StoreError::Unavailable(format!("invalid batching window: {:?}", window)))?;

        self.store
            .exists_in_window(scope.recipient_id, scope.kind, scope.batch_key, since)
            .await
    }
}

/// Redis-backed guard; atomic across processes.
pub struct RedisBatchGuard {
    redis: ConnectionManager,
}

impl RedisBatchGuard {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn key(scope: &BatchScope<'_>) -> String {
        format!(
            "tidings:batch:{}:{}:{}",
            scope.recipient_id, scope.kind, scope.batch_key
        )
    }
}

#[async_trait]
impl BatchGuard for RedisBatchGuard {
    /// `SET key "1" NX EX window`: a set key means this candidate is the
    /// first in its window; an existing key means suppress.
    async fn should_suppress(
        &self,
        scope: &BatchScope<'_>,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let key = Self::key(scope);
        let ttl_secs = window.as_secs().max(1);
        let mut redis = self.redis.clone();

        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut redis)
            .await?;

        let suppress = result.is_none();
        if suppress {
            tracing::debug!(key = %key, ttl_secs, "Batch window already open");
        }

        Ok(suppress)
    }

    async fn release(&self, scope: &BatchScope<'_>) -> Result<(), StoreError> {
        let mut redis = self.redis.clone();
        redis.del::<_, ()>(Self::key(scope)).await?;
        Ok(())
    }
}
