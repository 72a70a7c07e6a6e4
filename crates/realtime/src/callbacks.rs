//! Event callback registry.
//!
//! Two event names exist: `notification_change` and `connection_status`, each
//! with its own statically typed listener signature. Listeners are invoked one
//! after another; an error or panic in one is logged and does not stop the rest.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tidings_common::types::{ConnectionStatusEvent, NotificationChange};

pub const NOTIFICATION_CHANGE: &str = "notification_change";
pub const CONNECTION_STATUS: &str = "connection_status";

pub type Callback<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;
pub type NotificationCallback = Callback<NotificationChange>;
pub type StatusCallback = Callback<ConnectionStatusEvent>;

/// Handle returned on registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
pub struct CallbackRegistry {
    next_id: u64,
    notification: Vec<(CallbackId, NotificationCallback)>,
    status: Vec<(CallbackId, StatusCallback)>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_notification<F>(&mut self, callback: F) -> CallbackId
    where
        F: Fn(&NotificationChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.notification.push((id, Arc::new(callback)));
        id
    }

    pub fn add_status<F>(&mut self, callback: F) -> CallbackId
    where
        F: Fn(&ConnectionStatusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.status.push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.len();
        self.notification.retain(|(cid, _)| *cid != id);
        self.status.retain(|(cid, _)| *cid != id);
        self.len() < before
    }

    pub fn clear(&mut self) {
        self.notification.clear();
        self.status.clear();
    }

    pub fn len(&self) -> usize {
        self.notification.len() + self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the notification listeners, for invoking outside a lock.
    pub fn notification_callbacks(&self) -> Vec<NotificationCallback> {
        self.notification.iter().map(|(_, cb)| cb.clone()).collect()
    }

    pub fn status_callbacks(&self) -> Vec<StatusCallback> {
        self.status.iter().map(|(_, cb)| cb.clone()).collect()
    }

    fn allocate_id(&mut self) -> CallbackId {
        self.next_id += 1;
        CallbackId(self.next_id)
    }
}

/// Invoke every listener with `payload`. Returns the number that failed.
pub fn invoke_all<T>(event: &str, callbacks: &[Callback<T>], payload: &T) -> usize {
    let mut failed = 0;

    for callback in callbacks {
        match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                tracing::warn!(event, error = %e, "Callback failed");
            }
            Err(panic) => {
                failed += 1;
                tracing::error!(event, panic = panic_message(&*panic), "Callback panicked");
            }
        }
    }

    failed
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
