//! Push channel — advisory "a notification changed" signals.
//!
//! Delivery does not depend on it: the poll loops find every row anyway. The
//! push channel gives low latency while healthy and is the connection whose
//! health the manager tracks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use tidings_common::error::ChannelError;
use tidings_common::types::{ChangeKind, NotificationRef};

/// Postgres channel the change trigger publishes on.
pub const CHANGES_CHANNEL: &str = "notification_changes";
/// Postgres channel used for heartbeat round-trips.
pub const HEARTBEAT_CHANNEL: &str = "notification_heartbeat";

/// One signal received from a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushSignal {
    Change {
        kind: ChangeKind,
        notification: NotificationRef,
    },
    /// The channel answered a ping.
    Heartbeat,
}

/// A live subscription. Errors are terminal: the manager drops it and reconnects.
#[async_trait]
pub trait PushSubscription: Send {
    async fn next_signal(&mut self) -> Result<PushSignal, ChannelError>;
}

/// Source of push subscriptions.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn PushSubscription>, ChannelError>;

    /// Request a heartbeat. The answer arrives as [`PushSignal::Heartbeat`] on
    /// live subscriptions; a dead listener never answers.
    async fn ping(&self) -> Result<(), ChannelError>;
}

// ============================================================
// PostgreSQL LISTEN/NOTIFY
// ============================================================

/// Payload published by the `publish_notification_change` trigger.
#[derive(Debug, Deserialize)]
struct ChangePayload {
    op: ChangeKind,
    id: Uuid,
    recipient_id: String,
}

/// Push channel over PostgreSQL `LISTEN`/`NOTIFY`.
#[derive(Clone)]
pub struct PgPushChannel {
    pool: PgPool,
}

impl PgPushChannel {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PushChannel for PgPushChannel {
    async fn subscribe(&self) -> Result<Box<dyn PushSubscription>, ChannelError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all([CHANGES_CHANNEL, HEARTBEAT_CHANNEL])
            .await?;

        tracing::info!(
            channels = ?[CHANGES_CHANNEL, HEARTBEAT_CHANNEL],
            "Listening for notification changes"
        );
        Ok(Box::new(PgPushSubscription { listener }))
    }

    async fn ping(&self) -> Result<(), ChannelError> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(HEARTBEAT_CHANNEL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

struct PgPushSubscription {
    listener: PgListener,
}

#[async_trait]
impl PushSubscription for PgPushSubscription {
    async fn next_signal(&mut self) -> Result<PushSignal, ChannelError> {
        loop {
            // `None` means the listener lost its connection.
            let Some(notification) = self.listener.try_recv().await? else {
                return Err(ChannelError::Closed);
            };

            if notification.channel() == HEARTBEAT_CHANNEL {
                return Ok(PushSignal::Heartbeat);
            }

            match serde_json::from_str::<ChangePayload>(notification.payload()) {
                Ok(payload) => {
                    return Ok(PushSignal::Change {
                        kind: payload.op,
                        notification: NotificationRef {
                            id: payload.id,
                            recipient_id: payload.recipient_id,
                        },
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        channel = notification.channel(),
                        payload = notification.payload(),
                        error = %e,
                        "Skipping malformed change payload"
                    );
                }
            }
        }
    }
}

// ============================================================
// In-process channel
// ============================================================

const LOCAL_CAPACITY: usize = 256;

/// In-process push channel for embedders without PostgreSQL, paired with the
/// memory store. Availability and heartbeat echo can be switched off to
/// exercise the manager's failure handling.
pub struct LocalPushChannel {
    sender: Mutex<broadcast::Sender<PushSignal>>,
    available: AtomicBool,
    echo_heartbeat: AtomicBool,
    subscribe_attempts: AtomicUsize,
}

impl LocalPushChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_CAPACITY);
        Self {
            sender: Mutex::new(sender),
            available: AtomicBool::new(true),
            echo_heartbeat: AtomicBool::new(true),
            subscribe_attempts: AtomicUsize::new(0),
        }
    }

    /// Announce a changed notification to every live subscriber.
    pub fn publish(&self, kind: ChangeKind, notification: NotificationRef) -> usize {
        self.sender
            .lock()
            .send(PushSignal::Change { kind, notification })
            .unwrap_or(0)
    }

    /// Refuse (or accept again) new subscriptions.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Stop answering pings, simulating a silently dead connection.
    pub fn set_echo_heartbeat(&self, echo: bool) {
        self.echo_heartbeat.store(echo, Ordering::SeqCst);
    }

    /// End every live subscription with [`ChannelError::Closed`].
    pub fn close_subscriptions(&self) {
        let (sender, _) = broadcast::channel(LOCAL_CAPACITY);
        *self.sender.lock() = sender;
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.lock().receiver_count()
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }
}

impl Default for LocalPushChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushChannel for LocalPushChannel {
    async fn subscribe(&self) -> Result<Box<dyn PushSubscription>, ChannelError> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(ChannelError::Subscribe("local channel unavailable".into()));
        }
        let receiver = self.sender.lock().subscribe();
        Ok(Box::new(LocalSubscription { receiver }))
    }

    async fn ping(&self) -> Result<(), ChannelError> {
        if self.echo_heartbeat.load(Ordering::SeqCst) {
            // No subscribers is not an error for a ping.
            let _ = self.sender.lock().send(PushSignal::Heartbeat);
        }
        Ok(())
    }
}

struct LocalSubscription {
    receiver: broadcast::Receiver<PushSignal>,
}

#[async_trait]
impl PushSubscription for LocalSubscription {
    async fn next_signal(&mut self) -> Result<PushSignal, ChannelError> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) => return Ok(signal),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Local push subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ChannelError::Closed),
            }
        }
    }
}
