//! Realtime connection manager — keeps listeners informed of new notifications
//! while the push channel comes and goes.
//!
//! Timers:
//! - connect: first subscription attempt, then each backoff reconnect
//! - listener: drains the live push subscription
//! - heartbeat: liveness check of the push channel, plus a health log line
//! - primary poll: delivers rows created in the recent window, always on
//! - fallback poll: unread snapshot while the push channel is unhealthy
//!
//! Every timer is a task in the current session's `JoinSet` with its own
//! child cancellation token. At most one task per timer kind runs at a time.
//! All shared state sits behind one mutex that is never held across an
//! `.await` or while listeners run. `force_refresh` and `cleanup` take a
//! second, async lifecycle lock for their whole teardown and restart.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tidings_common::config::RealtimeConfig;
use tidings_common::error::ChannelError;
use tidings_common::types::{
    ChangeKind, ConnectionHealth, ConnectionStatus, ConnectionStatusEvent, Notification,
    NotificationChange,
};
use tidings_engine::store::{NotificationStore, with_timeout};

use crate::callbacks::{CONNECTION_STATUS, CallbackId, CallbackRegistry, NOTIFICATION_CHANGE, invoke_all};
use crate::channel::{PushChannel, PushSignal, PushSubscription};
use crate::health::{HealthMonitor, HealthPolicy, Recovery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    Connect,
    Listener,
    Heartbeat,
    PrimaryPoll,
    FallbackPoll,
}

struct TimerSlot {
    token: CancellationToken,
    handle: AbortHandle,
}

/// Everything started by one `initialize()`.
struct Session {
    token: CancellationToken,
    tasks: JoinSet<()>,
    timers: HashMap<TimerKind, TimerSlot>,
}

impl Session {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
            timers: HashMap::new(),
        }
    }

    /// Drop finished tasks from the set.
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!(error = %e, "Realtime task panicked");
            }
        }
    }

    fn is_running(&self, kind: TimerKind) -> bool {
        self.timers
            .get(&kind)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    fn stop(&mut self, kind: TimerKind) {
        if let Some(slot) = self.timers.remove(&kind) {
            slot.token.cancel();
        }
    }
}

/// Ids already handed to listeners, so the primary poll delivers each row once.
#[derive(Default)]
struct DeliveredSet {
    seen: HashMap<Uuid, DateTime<Utc>>,
}

impl DeliveredSet {
    /// Returns `true` if `id` had not been delivered yet.
    fn mark(&mut self, id: Uuid, now: DateTime<Utc>) -> bool {
        self.seen.insert(id, now).is_none()
    }

    fn prune(&mut self, horizon: DateTime<Utc>) {
        self.seen.retain(|_, seen_at| *seen_at >= horizon);
    }

    fn clear(&mut self) {
        self.seen.clear();
    }
}

struct Shared {
    health: HealthMonitor,
    callbacks: CallbackRegistry,
    session: Option<Session>,
    delivered: DeliveredSet,
    /// Set by `cleanup`; no session is started afterwards.
    closed: bool,
}

struct Inner {
    config: RealtimeConfig,
    channel: Arc<dyn PushChannel>,
    store: Arc<dyn NotificationStore>,
    shared: Mutex<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Handle to the realtime connection manager. Clones share one manager.
///
/// Timer tasks hold a handle too: call [`RealtimeManager::cleanup`] when done.
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<Inner>,
}

impl RealtimeManager {
    pub fn new(
        config: RealtimeConfig,
        channel: Arc<dyn PushChannel>,
        store: Arc<dyn NotificationStore>,
    ) -> Self {
        let health = HealthMonitor::new(HealthPolicy::from(&config));
        Self {
            inner: Arc::new(Inner {
                config,
                channel,
                store,
                shared: Mutex::new(Shared {
                    health,
                    callbacks: CallbackRegistry::new(),
                    session: None,
                    delivered: DeliveredSet::default(),
                    closed: false,
                }),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Start connecting and start the poll and heartbeat timers.
    ///
    /// Must be called inside a tokio runtime. A no-op while a session is
    /// already running, and after `cleanup`.
    pub fn initialize(&self) {
        let mut shared = self.inner.shared.lock();
        if shared.closed {
            tracing::debug!("Realtime manager cleaned up, not initializing");
            return;
        }
        if shared.session.is_some() {
            tracing::debug!("Realtime manager already initialized");
            return;
        }
        shared.session = Some(Session::new());

        self.start_timer(&mut shared, TimerKind::Connect, |manager, token| async move {
            manager.run_connect(token, None).await;
        });
        self.start_timer(&mut shared, TimerKind::Heartbeat, |manager, token| async move {
            manager.run_heartbeat(token).await;
        });
        if self.inner.config.primary_poll_enabled {
            self.start_timer(&mut shared, TimerKind::PrimaryPoll, |manager, token| async move {
                manager.run_primary_poll(token).await;
            });
        }

        tracing::info!(
            heartbeat_interval_ms = self.inner.config.heartbeat_interval.as_millis() as u64,
            primary_poll = self.inner.config.primary_poll_enabled,
            "Realtime manager initialized"
        );
    }

    /// Cancel everything and start over with counters reset. Registered
    /// callbacks are kept. Does nothing once the manager is cleaned up.
    pub async fn force_refresh(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        tracing::info!("Forcing realtime refresh");
        self.teardown().await;
        {
            let mut shared = self.inner.shared.lock();
            shared.health.reset();
            shared.delivered.clear();
        }
        self.initialize();
    }

    /// Stop every timer and clear the callback registry. Once this returns no
    /// callback is invoked again and the manager stays shut down.
    pub async fn cleanup(&self) {
        // Closed before waiting, so a refresh queued behind us cannot restart.
        self.inner.shared.lock().closed = true;
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.teardown().await;
        {
            let mut shared = self.inner.shared.lock();
            shared.callbacks.clear();
            shared.health.reset();
            shared.delivered.clear();
        }
        tracing::info!("Realtime manager cleaned up");
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        self.inner.shared.lock().health.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.lock().health.status() == ConnectionStatus::Connected
    }

    /// Register a `notification_change` listener.
    pub fn add_notification_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&NotificationChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.shared.lock().callbacks.add_notification(callback)
    }

    /// Register a `connection_status` listener.
    pub fn add_status_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&ConnectionStatusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.shared.lock().callbacks.add_status(callback)
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.shared.lock().callbacks.remove(id)
    }

    /// Take the session, cancel it and wait for every task to finish.
    async fn teardown(&self) {
        let session = self.inner.shared.lock().session.take();
        let Some(mut session) = session else {
            return;
        };

        session.token.cancel();
        while let Some(result) = session.tasks.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!(error = %e, "Realtime task panicked");
            }
        }
    }

    /// Spawn a timer task unless one of that kind is already running.
    fn start_timer<F, Fut>(&self, shared: &mut Shared, kind: TimerKind, task: F)
    where
        F: FnOnce(RealtimeManager, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(session) = shared.session.as_mut() else {
            return;
        };
        session.reap();
        if session.is_running(kind) {
            return;
        }

        let token = session.token.child_token();
        let handle = session.tasks.spawn(task(self.clone(), token.clone()));
        session.timers.insert(kind, TimerSlot { token, handle });
    }

    fn stop_timer(shared: &mut Shared, kind: TimerKind) {
        if let Some(session) = shared.session.as_mut() {
            session.stop(kind);
        }
    }

    /// Forget the slot of a task that is about to hand over to its successor.
    fn release_slot(shared: &mut Shared, kind: TimerKind) {
        if let Some(session) = shared.session.as_mut() {
            session.timers.remove(&kind);
        }
    }

    // ============================================================
    // Connection lifecycle
    // ============================================================

    async fn run_connect(self, token: CancellationToken, delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let (event, attempt) = {
            let mut shared = self.inner.shared.lock();
            if token.is_cancelled() {
                return;
            }
            if delay.is_some() {
                shared.health.begin_reconnect();
            } else {
                shared.health.begin_connect();
            }
            (
                shared.health.status_event(None),
                shared.health.snapshot().reconnect_attempts,
            )
        };
        tracing::info!(attempt, "Connecting to push channel");
        self.emit_status(&token, &event);

        let connect_timeout = self.inner.config.connect_timeout;
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = tokio::time::timeout(connect_timeout, self.inner.channel.subscribe()) => result,
        };

        Self::release_slot(&mut self.inner.shared.lock(), TimerKind::Connect);

        match result {
            Ok(Ok(subscription)) => self.on_connected(&token, subscription),
            Ok(Err(e)) => self.on_failure(&token, e),
            Err(_) => self.on_failure(&token, ChannelError::Timeout(connect_timeout)),
        }
    }

    fn on_connected(&self, token: &CancellationToken, subscription: Box<dyn PushSubscription>) {
        let event = {
            let mut shared = self.inner.shared.lock();
            if token.is_cancelled() {
                return;
            }

            if shared.health.record_connected(Instant::now()) {
                Self::stop_timer(&mut shared, TimerKind::FallbackPoll);
                tracing::info!("Push channel recovered, fallback polling stopped");
            }
            shared.health.set_active_channels(1);

            // A previous listener may still be draining a dead subscription.
            Self::stop_timer(&mut shared, TimerKind::Listener);
            self.start_timer(&mut shared, TimerKind::Listener, move |manager, token| async move {
                manager.run_listener(token, subscription).await;
            });

            shared.health.status_event(None)
        };

        tracing::info!("Push channel connected");
        self.emit_status(token, &event);
    }

    /// Count a failure of any kind and schedule recovery.
    fn on_failure(&self, token: &CancellationToken, error: ChannelError) {
        let (event, health) = {
            let mut shared = self.inner.shared.lock();
            if token.is_cancelled() || shared.session.is_none() {
                return;
            }

            let outcome = shared.health.record_failure();

            if outcome.activate_fallback {
                self.start_timer(&mut shared, TimerKind::FallbackPoll, |manager, token| async move {
                    manager.run_fallback_poll(token).await;
                });
            }

            match outcome.recovery {
                Recovery::Reconnect { delay } => {
                    self.start_timer(&mut shared, TimerKind::Connect, move |manager, token| async move {
                        manager.run_connect(token, Some(delay)).await;
                    });
                }
                Recovery::Exhausted => {
                    Self::stop_timer(&mut shared, TimerKind::Listener);
                }
                Recovery::Idle => {}
            }

            (
                shared.health.status_event(Some(error.to_string())),
                shared.health.snapshot(),
            )
        };

        if health.status == ConnectionStatus::Disconnected && health.fallback_active {
            tracing::error!(
                error = %error,
                error_count = health.error_count,
                reconnect_attempts = health.reconnect_attempts,
                "Push channel unavailable, staying on fallback polling until refreshed"
            );
        } else {
            tracing::warn!(
                error = %error,
                error_count = health.error_count,
                reconnect_attempts = health.reconnect_attempts,
                fallback_active = health.fallback_active,
                "Realtime channel failure"
            );
        }

        self.emit_status(token, &event);
    }

    async fn run_listener(self, token: CancellationToken, mut subscription: Box<dyn PushSubscription>) {
        loop {
            let signal = tokio::select! {
                _ = token.cancelled() => return,
                signal = subscription.next_signal() => signal,
            };

            match signal {
                Ok(PushSignal::Heartbeat) => {
                    self.inner.shared.lock().health.record_heartbeat(Instant::now());
                }
                Ok(PushSignal::Change { kind, notification }) => {
                    {
                        let mut shared = self.inner.shared.lock();
                        shared.health.record_heartbeat(Instant::now());
                        if kind == ChangeKind::Insert {
                            shared.delivered.mark(notification.id, Utc::now());
                        }
                    }
                    tracing::debug!(
                        notification_id = %notification.id,
                        recipient_id = %notification.recipient_id,
                        ?kind,
                        "Push change received"
                    );
                    self.emit_change(&token, &NotificationChange::from_push(kind, notification));
                }
                Err(e) => {
                    {
                        let mut shared = self.inner.shared.lock();
                        if token.is_cancelled() {
                            return;
                        }
                        Self::release_slot(&mut shared, TimerKind::Listener);
                        shared.health.set_active_channels(0);
                    }
                    self.on_failure(&token, e);
                    return;
                }
            }
        }
    }

    // ============================================================
    // Heartbeat
    // ============================================================

    async fn run_heartbeat(self, token: CancellationToken) {
        let period = self.inner.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.check_heartbeat(&token).await,
            }
        }
    }

    async fn check_heartbeat(&self, token: &CancellationToken) {
        let (overdue, health) = {
            let mut shared = self.inner.shared.lock();
            let overdue = shared.health.heartbeat_overdue(Instant::now());
            if overdue.is_some() {
                Self::stop_timer(&mut shared, TimerKind::Listener);
                shared.health.set_active_channels(0);
            }
            (overdue, shared.health.snapshot())
        };

        log_health_metrics(&health);

        if let Some(elapsed) = overdue {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Heartbeat missed, push channel presumed dead"
            );
            self.on_failure(
                token,
                ChannelError::HeartbeatTimeout(self.inner.config.heartbeat_timeout()),
            );
            return;
        }

        if health.status != ConnectionStatus::Connected {
            return;
        }

        let query_timeout = self.inner.config.query_timeout;
        match tokio::time::timeout(query_timeout, self.inner.channel.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.on_failure(token, e),
            Err(_) => self.on_failure(token, ChannelError::Timeout(query_timeout)),
        }
    }

    // ============================================================
    // Polling
    // ============================================================

    async fn run_primary_poll(self, token: CancellationToken) {
        let period = self.inner.config.primary_poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.poll_recent(&token).await,
            }
        }
    }

    /// Deliver rows from the recent window that no listener has seen yet.
    async fn poll_recent(&self, token: &CancellationToken) {
        let now = Utc::now();
        let since = match chrono::Duration::from_std(self.inner.config.primary_poll_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        {
            Some(since) => since,
            None => {
                tracing::error!(
                    window_secs = self.inner.config.primary_poll_window.as_secs(),
                    "Invalid primary poll window"
                );
                return;
            }
        };

        let result = with_timeout(
            self.inner.config.query_timeout,
            self.inner
                .store
                .select_recent(since, self.inner.config.recipient.as_deref()),
        )
        .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                self.on_failure(token, ChannelError::Poll(e));
                return;
            }
        };

        let fresh: Vec<Notification> = {
            let mut shared = self.inner.shared.lock();
            if token.is_cancelled() {
                return;
            }
            // Keep ids a full window past the point they could reappear.
            let horizon = since
                .checked_sub_signed(now - since)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            shared.delivered.prune(horizon);
            rows.into_iter()
                .filter(|n| shared.delivered.mark(n.id, now))
                .collect()
        };

        if fresh.is_empty() {
            return;
        }

        tracing::debug!(count = fresh.len(), "Primary poll found new notifications");
        self.emit_change(token, &NotificationChange::PollingUpdate(fresh));
    }

    async fn run_fallback_poll(self, token: CancellationToken) {
        let period = self.inner.config.fallback_poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = period.as_millis() as u64,
            "Fallback polling started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.poll_unread(&token).await,
            }
        }

        tracing::info!("Fallback polling stopped");
    }

    /// Deliver the current unread snapshot.
    async fn poll_unread(&self, token: &CancellationToken) {
        let result = with_timeout(
            self.inner.config.query_timeout,
            self.inner.store.select_unread(
                self.inner.config.recipient.as_deref(),
                self.inner.config.unread_poll_limit,
            ),
        )
        .await;

        match result {
            Ok(rows) if rows.is_empty() => {}
            Ok(rows) => {
                tracing::debug!(count = rows.len(), "Fallback poll delivered unread notifications");
                self.emit_change(token, &NotificationChange::PollingUpdate(rows));
            }
            Err(e) => self.on_failure(token, ChannelError::Poll(e)),
        }
    }

    // ============================================================
    // Callback dispatch
    // ============================================================

    fn emit_change(&self, token: &CancellationToken, change: &NotificationChange) {
        let callbacks = {
            let shared = self.inner.shared.lock();
            if token.is_cancelled() {
                return;
            }
            shared.callbacks.notification_callbacks()
        };
        invoke_all(NOTIFICATION_CHANGE, &callbacks, change);
    }

    fn emit_status(&self, token: &CancellationToken, event: &ConnectionStatusEvent) {
        let callbacks = {
            let shared = self.inner.shared.lock();
            if token.is_cancelled() {
                return;
            }
            shared.callbacks.status_callbacks()
        };
        invoke_all(CONNECTION_STATUS, &callbacks, event);
    }
}

fn log_health_metrics(health: &ConnectionHealth) {
    let last_heartbeat = health.last_heartbeat.map(|t| t.to_rfc3339());
    if health.status == ConnectionStatus::Connected {
        tracing::debug!(
            status = %health.status,
            last_heartbeat = ?last_heartbeat,
            reconnect_attempts = health.reconnect_attempts,
            error_count = health.error_count,
            active_channels = health.active_channels,
            fallback_active = health.fallback_active,
            "Realtime health"
        );
    } else {
        tracing::warn!(
            status = %health.status,
            last_heartbeat = ?last_heartbeat,
            reconnect_attempts = health.reconnect_attempts,
            error_count = health.error_count,
            active_channels = health.active_channels,
            fallback_active = health.fallback_active,
            "Realtime health degraded"
        );
    }
}
