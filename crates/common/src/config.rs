use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * 60;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Longest accepted retention period, in days.
pub const MAX_RETENTION_DAYS: u64 = 100 * 365;

/// Longest accepted primary poll look-back.
pub const MAX_PRIMARY_POLL_WINDOW: Duration = Duration::from_secs(SECS_PER_DAY);

/// `days` whole days, or `None` past [`MAX_RETENTION_DAYS`].
pub fn retention_days(days: u64) -> Option<Duration> {
    (days <= MAX_RETENTION_DAYS).then(|| Duration::from_secs(days * SECS_PER_DAY))
}

/// Where the batching guard looks for recent equivalent notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchBackend {
    /// Query the notification store (default).
    #[default]
    Store,
    /// Atomic `SET NX EX` keys in Redis.
    Redis,
}

impl FromStr for BatchBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "store" => Ok(Self::Store),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown batch backend '{}'", other)),
        }
    }
}

/// Settings for the notification dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Window during which equivalent notifications are suppressed.
    pub batch_window: Duration,
    /// Age after which notifications are deleted by the retention sweep.
    pub retention: Duration,
    /// Upper bound for any single store call.
    pub store_timeout: Duration,
    /// Recipient used when the personnel directory cannot be queried.
    pub fallback_recipient: Option<String>,
    pub batch_backend: BatchBackend,
    /// When off, every request is persisted and batch keys are ignored.
    pub batching_enabled: bool,
    /// How often the binary runs the retention sweep.
    pub cleanup_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            store_timeout: Duration::from_secs(5),
            fallback_recipient: None,
            batch_backend: BatchBackend::Store,
            batching_enabled: true,
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Settings for the realtime connection manager.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Heartbeat check period; the channel is declared dead after twice this.
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubled for every failed attempt.
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub max_errors_before_fallback: u32,
    pub fallback_poll_interval: Duration,
    pub primary_poll_enabled: bool,
    pub primary_poll_interval: Duration,
    /// How far back the primary poll looks for new rows.
    pub primary_poll_window: Duration,
    /// Row limit of the fallback unread query.
    pub unread_poll_limit: i64,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    /// Restrict poll queries to one recipient.
    pub recipient: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            max_errors_before_fallback: 3,
            fallback_poll_interval: Duration::from_secs(5),
            primary_poll_enabled: true,
            primary_poll_interval: Duration::from_secs(2),
            primary_poll_window: Duration::from_secs(30),
            unread_poll_limit: 10,
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(5),
            recipient: None,
        }
    }
}

impl RealtimeConfig {
    /// Silence longer than this while connected is a heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string, required for the Redis batching backend
    pub redis_url: Option<String>,

    /// HTTP listen port (default: 3000)
    pub api_port: u16,

    pub dispatch: DispatchConfig,

    pub realtime: RealtimeConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let dispatch_defaults = DispatchConfig::default();
        let realtime_defaults = RealtimeConfig::default();

        let dispatch = DispatchConfig {
            batch_window: env_scaled(
                "NOTIFY_BATCH_WINDOW_MINUTES",
                dispatch_defaults.batch_window,
                SECS_PER_MINUTE,
            )?,
            retention: env_scaled("NOTIFY_RETENTION_DAYS", dispatch_defaults.retention, SECS_PER_DAY)?,
            store_timeout: env_millis("NOTIFY_STORE_TIMEOUT_MS", dispatch_defaults.store_timeout)?,
            fallback_recipient: std::env::var("NOTIFY_FALLBACK_RECIPIENT").ok(),
            batch_backend: match std::env::var("NOTIFY_BATCH_BACKEND") {
                Ok(raw) => raw
                    .parse()
                    .map_err(|e| anyhow::anyhow!("NOTIFY_BATCH_BACKEND: {}", e))?,
                Err(_) => dispatch_defaults.batch_backend,
            },
            batching_enabled: env_or("NOTIFICATION_BATCHING_ENABLED", dispatch_defaults.batching_enabled)?,
            cleanup_interval: env_scaled(
                "NOTIFY_CLEANUP_INTERVAL_HOURS",
                dispatch_defaults.cleanup_interval,
                SECS_PER_HOUR,
            )?,
        };

        let realtime = RealtimeConfig {
            heartbeat_interval: env_millis(
                "REALTIME_HEARTBEAT_INTERVAL_MS",
                realtime_defaults.heartbeat_interval,
            )?,
            reconnect_base_delay: env_millis(
                "REALTIME_RECONNECT_BASE_DELAY_MS",
                realtime_defaults.reconnect_base_delay,
            )?,
            max_reconnect_attempts: env_or(
                "REALTIME_MAX_RECONNECT_ATTEMPTS",
                realtime_defaults.max_reconnect_attempts,
            )?,
            max_errors_before_fallback: env_or(
                "REALTIME_MAX_ERRORS_BEFORE_FALLBACK",
                realtime_defaults.max_errors_before_fallback,
            )?,
            fallback_poll_interval: env_millis(
                "REALTIME_FALLBACK_POLL_INTERVAL_MS",
                realtime_defaults.fallback_poll_interval,
            )?,
            primary_poll_enabled: env_or(
                "REALTIME_PRIMARY_POLL_ENABLED",
                realtime_defaults.primary_poll_enabled,
            )?,
            primary_poll_interval: env_millis(
                "REALTIME_PRIMARY_POLL_INTERVAL_MS",
                realtime_defaults.primary_poll_interval,
            )?,
            primary_poll_window: Duration::from_secs(env_or(
                "REALTIME_PRIMARY_POLL_WINDOW_SECS",
                realtime_defaults.primary_poll_window.as_secs(),
            )?),
            unread_poll_limit: env_or("REALTIME_UNREAD_POLL_LIMIT", realtime_defaults.unread_poll_limit)?,
            connect_timeout: env_millis("REALTIME_CONNECT_TIMEOUT_MS", realtime_defaults.connect_timeout)?,
            query_timeout: env_millis("REALTIME_QUERY_TIMEOUT_MS", realtime_defaults.query_timeout)?,
            recipient: std::env::var("REALTIME_RECIPIENT").ok(),
        };

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            redis_url: std::env::var("REDIS_URL").ok(),
            api_port: env_or("API_PORT", 3000)?,
            dispatch,
            realtime,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would busy-loop or never fire.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.realtime.heartbeat_interval < Duration::from_millis(1000) {
            errors.push("REALTIME_HEARTBEAT_INTERVAL_MS must be at least 1000ms");
        }
        if self.dispatch.batch_window < Duration::from_secs(10) {
            errors.push("NOTIFY_BATCH_WINDOW_MINUTES must cover at least 10 seconds");
        }
        if self.realtime.max_reconnect_attempts == 0 {
            errors.push("REALTIME_MAX_RECONNECT_ATTEMPTS must be at least 1");
        }
        if self.realtime.max_errors_before_fallback == 0 {
            errors.push("REALTIME_MAX_ERRORS_BEFORE_FALLBACK must be at least 1");
        }
        if self.realtime.fallback_poll_interval.is_zero()
            || self.realtime.primary_poll_interval.is_zero()
            || self.realtime.reconnect_base_delay.is_zero()
        {
            errors.push("realtime poll intervals and reconnect delay must be positive");
        }
        if self.dispatch.store_timeout.is_zero() || self.dispatch.cleanup_interval.is_zero() {
            errors.push("NOTIFY_STORE_TIMEOUT_MS and NOTIFY_CLEANUP_INTERVAL_HOURS must be positive");
        }
        if self.dispatch.retention > Duration::from_secs(MAX_RETENTION_DAYS * SECS_PER_DAY) {
            errors.push("NOTIFY_RETENTION_DAYS must not exceed 36500");
        }
        if self.dispatch.batch_window > Duration::from_secs(7 * SECS_PER_DAY) {
            errors.push("NOTIFY_BATCH_WINDOW_MINUTES must not exceed one week");
        }
        if self.realtime.primary_poll_window.is_zero()
            || self.realtime.primary_poll_window > MAX_PRIMARY_POLL_WINDOW
        {
            errors.push("REALTIME_PRIMARY_POLL_WINDOW_SECS must be between 1 and 86400");
        }
        if self.realtime.unread_poll_limit <= 0 {
            errors.push("REALTIME_UNREAD_POLL_LIMIT must be positive");
        }
        if self.dispatch.batch_backend == BatchBackend::Redis && self.redis_url.is_none() {
            errors.push("REDIS_URL is required when NOTIFY_BATCH_BACKEND=redis");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Invalid configuration: {}", errors.join("; ")))
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

/// Read a whole number of `unit_secs` units, rejecting values that overflow.
fn env_scaled(key: &str, default: Duration, unit_secs: u64) -> anyhow::Result<Duration> {
    let count = env_or(key, default.as_secs() / unit_secs)?;
    count
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("{} is too large: {}", key, count))
}

fn env_millis(key: &str, default: Duration) -> anyhow::Result<Duration> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}
