use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Open attribute bag attached to every notification.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key used by the batching guard.
pub const BATCH_KEY: &str = "batch_key";

/// Metadata key recording which role a fan-out recipient was resolved through.
pub const RECIPIENT_ROLE_KEY: &str = "recipient_role";

/// Advisory priority of a notification. Does not alter the delivery path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Status of the live delivery channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// A persisted notification addressed to exactly one recipient.
///
/// `id`, `kind`, `recipient_id` and `created_at` never change once stored;
/// only `is_read` may flip from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Notification {
    /// Materialize a request into a fresh, unread notification stamped `now`.
    pub fn from_request(request: &NotificationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id: request.recipient_id.clone(),
            kind: request.kind.clone(),
            title: request.title.clone(),
            body: request.body.clone(),
            priority: request.priority,
            is_read: false,
            created_at: Utc::now(),
            metadata: serde_json::Value::Object(request.metadata.clone()),
        }
    }

    /// The batching key recorded in metadata, if any.
    pub fn batch_key(&self) -> Option<&str> {
        self.metadata.get(BATCH_KEY).and_then(|v| v.as_str())
    }

    pub fn to_ref(&self) -> NotificationRef {
        NotificationRef {
            id: self.id,
            recipient_id: self.recipient_id.clone(),
        }
    }
}

/// A request to notify a single recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NotificationRequest {
    pub fn new(
        recipient_id: impl Into<String>,
        kind: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            kind: kind.into(),
            title: title.into(),
            body: body.into(),
            priority,
            metadata: Metadata::new(),
        }
    }

    /// Set the batching key; equivalent requests inside the batching window
    /// collapse into one stored notification.
    pub fn with_batch_key(mut self, batch_key: impl Into<String>) -> Self {
        self.metadata
            .insert(BATCH_KEY.to_string(), serde_json::Value::String(batch_key.into()));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn batch_key(&self) -> Option<&str> {
        self.metadata.get(BATCH_KEY).and_then(|v| v.as_str())
    }

    /// Reject requests the store would accept but nobody can display.
    pub fn validate(&self) -> Result<(), String> {
        if self.recipient_id.trim().is_empty() {
            return Err("recipient_id must not be empty".to_string());
        }
        if self.kind.trim().is_empty() {
            return Err("kind must not be empty".to_string());
        }
        if self.title.trim().is_empty() {
            return Err("title must not be empty".to_string());
        }
        if self.body.trim().is_empty() {
            return Err("body must not be empty".to_string());
        }
        Ok(())
    }
}

/// A notification request addressed to roles rather than a single user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleNotificationRequest {
    pub kind: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RoleNotificationRequest {
    pub fn new(
        kind: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            kind: kind.into(),
            title: title.into(),
            body: body.into(),
            priority,
            metadata: Metadata::new(),
        }
    }

    pub fn with_batch_key(mut self, batch_key: impl Into<String>) -> Self {
        self.metadata
            .insert(BATCH_KEY.to_string(), serde_json::Value::String(batch_key.into()));
        self
    }

    /// Address the request to one resolved recipient, tagging the role it
    /// was resolved through.
    pub fn for_recipient(&self, recipient: &Recipient) -> NotificationRequest {
        let mut metadata = self.metadata.clone();
        metadata.insert(
            RECIPIENT_ROLE_KEY.to_string(),
            serde_json::Value::String(recipient.role.clone()),
        );
        NotificationRequest {
            recipient_id: recipient.user_id.clone(),
            kind: self.kind.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            priority: self.priority,
            metadata,
        }
    }
}

/// An active user eligible to receive role-routed notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub user_id: String,
    pub role: String,
    pub contact_address: Option<String>,
}

/// Notification counts for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationSummary {
    pub recipient_id: String,
    pub total: i64,
    pub unread: i64,
    pub latest_at: DateTime<Utc>,
}

/// Identity of a changed notification row, as carried by push signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRef {
    pub id: Uuid,
    pub recipient_id: String,
}

/// Row-level change observed on the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Payload of the `notification_change` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum NotificationChange {
    Insert(NotificationRef),
    Update(NotificationRef),
    PollingUpdate(Vec<Notification>),
}

impl NotificationChange {
    pub fn from_push(kind: ChangeKind, notification: NotificationRef) -> Self {
        match kind {
            ChangeKind::Insert => Self::Insert(notification),
            ChangeKind::Update => Self::Update(notification),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::PollingUpdate(_) => "polling_update",
        }
    }
}

/// Payload of the `connection_status` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusEvent {
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub fallback_active: bool,
}

/// Point-in-time view of the live channel's health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub error_count: u32,
    pub fallback_active: bool,
    pub active_channels: usize,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}
