//! Herald Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! Every section maps to one engine's options; engines take plain config
//! structs, so wiring a file section into an engine stays explicit.

use herald_common::{BackoffPolicy, IsolationLevel, QueueOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    pub outbox: OutboxConfig,
    pub inbox: InboxConfig,
    pub queue: QueueConfig,
    pub uow: UowConfig,
    pub retention: RetentionConfig,
}

impl HeraldConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: HeraldConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "outbox.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.outbox.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "outbox.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        self.outbox.backoff.to_policy()?;
        if self.inbox.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "inbox.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.queue.visibility_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "queue.visibility_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outbox drain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Max entries per drain cycle.
    pub batch_size: u32,
    /// Drain period in milliseconds.
    pub tick_interval_ms: u64,
    /// Default delivery attempts before Failed.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl OutboxConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            tick_interval_ms: 5_000,
            max_retries: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// "exponential" or "fixed".
    pub kind: String,
    /// Exponential base delay in milliseconds.
    pub base_ms: u64,
    /// Exponential cap in milliseconds.
    pub cap_ms: u64,
    /// Fixed delay in milliseconds.
    pub delay_ms: u64,
}

impl BackoffConfig {
    pub fn to_policy(&self) -> Result<BackoffPolicy, ConfigError> {
        match self.kind.as_str() {
            "exponential" => {
                if self.cap_ms < self.base_ms {
                    return Err(ConfigError::ValidationError(format!(
                        "outbox.backoff cap_ms {} is below base_ms {}",
                        self.cap_ms, self.base_ms
                    )));
                }
                Ok(BackoffPolicy::Exponential {
                    base_ms: self.base_ms,
                    cap_ms: self.cap_ms,
                })
            }
            "fixed" => Ok(BackoffPolicy::Fixed {
                delay_ms: self.delay_ms,
            }),
            other => Err(ConfigError::ValidationError(format!(
                "unknown backoff kind '{}' (expected \"exponential\" or \"fixed\")",
                other
            ))),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: "exponential".to_string(),
            base_ms: 1_000,
            cap_ms: 60_000,
            delay_ms: 1_000,
        }
    }
}

/// Inbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Uniqueness horizon in seconds.
    pub dedup_window_secs: u64,
    /// Age a Pending entry must reach before the processor retries it.
    pub stale_grace_secs: u64,
    pub batch_size: u32,
    pub tick_interval_ms: u64,
}

impl InboxConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 24 * 60 * 60,
            stale_grace_secs: 60,
            batch_size: 100,
            tick_interval_ms: 5_000,
        }
    }
}

/// Queue defaults with per-queue overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub visibility_timeout_secs: u64,
    pub max_dequeue_count: Option<u32>,
    pub max_size: Option<usize>,
    pub message_ttl_secs: Option<u64>,
    pub priority_enabled: bool,
    /// Per-queue overrides, keyed by queue name.
    pub overrides: HashMap<String, QueueOverride>,
}

impl QueueConfig {
    /// Effective options for a named queue: defaults with the queue's
    /// override fields applied on top.
    pub fn options_for(&self, queue: &str) -> QueueOptions {
        let mut options = QueueOptions {
            max_size: self.max_size,
            message_ttl: self.message_ttl_secs.map(Duration::from_secs),
            max_dequeue_count: self.max_dequeue_count,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            priority_enabled: self.priority_enabled,
        };
        if let Some(over) = self.overrides.get(queue) {
            if let Some(max_size) = over.max_size {
                options.max_size = Some(max_size);
            }
            if let Some(ttl) = over.message_ttl_secs {
                options.message_ttl = Some(Duration::from_secs(ttl));
            }
            if let Some(max_dequeue) = over.max_dequeue_count {
                options.max_dequeue_count = Some(max_dequeue);
            }
            if let Some(visibility) = over.visibility_timeout_secs {
                options.visibility_timeout = Duration::from_secs(visibility);
            }
            if let Some(priority) = over.priority_enabled {
                options.priority_enabled = priority;
            }
        }
        options
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 30,
            max_dequeue_count: None,
            max_size: None,
            message_ttl_secs: None,
            priority_enabled: true,
            overrides: HashMap::new(),
        }
    }
}

/// Per-queue override block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOverride {
    pub visibility_timeout_secs: Option<u64>,
    pub max_dequeue_count: Option<u32>,
    pub max_size: Option<usize>,
    pub message_ttl_secs: Option<u64>,
    pub priority_enabled: Option<bool>,
}

/// Unit-of-work configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UowConfig {
    pub default_isolation: IsolationLevel,
}

/// Cleanup horizons
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub outbox_secs: u64,
    pub inbox_secs: u64,
    pub sweep_interval_secs: u64,
}

impl RetentionConfig {
    pub fn outbox_retention(&self) -> Duration {
        Duration::from_secs(self.outbox_secs)
    }

    pub fn inbox_retention(&self) -> Duration {
        Duration::from_secs(self.inbox_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            outbox_secs: 7 * 24 * 60 * 60,
            inbox_secs: 7 * 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HeraldConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.inbox.dedup_window(), Duration::from_secs(86_400));
        assert_eq!(config.queue.visibility_timeout_secs, 30);
    }

    #[test]
    fn toml_round_trip_with_overrides() {
        let raw = r#"
            [outbox]
            batch_size = 25
            tick_interval_ms = 500

            [outbox.backoff]
            kind = "fixed"
            delay_ms = 250

            [inbox]
            dedup_window_secs = 3600

            [queue]
            visibility_timeout_secs = 10

            [queue.overrides.orders]
            max_size = 500
            visibility_timeout_secs = 60

            [uow]
            default_isolation = "serializable"

            [retention]
            outbox_secs = 86400
        "#;
        let config = HeraldConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.outbox.batch_size, 25);
        assert_eq!(
            config.outbox.backoff.to_policy().unwrap(),
            BackoffPolicy::Fixed { delay_ms: 250 }
        );
        assert_eq!(config.uow.default_isolation, IsolationLevel::Serializable);
        assert_eq!(config.retention.outbox_retention(), Duration::from_secs(86_400));

        let orders = config.queue.options_for("orders");
        assert_eq!(orders.max_size, Some(500));
        assert_eq!(orders.visibility_timeout, Duration::from_secs(60));

        let other = config.queue.options_for("other");
        assert_eq!(other.max_size, None);
        assert_eq!(other.visibility_timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_backoff_kind_is_rejected() {
        let raw = r#"
            [outbox.backoff]
            kind = "quadratic"
        "#;
        assert!(matches!(
            HeraldConfig::from_toml_str(raw),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let raw = r#"
            [outbox]
            batch_size = 0
        "#;
        assert!(matches!(
            HeraldConfig::from_toml_str(raw),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn cap_below_base_is_rejected() {
        let config = BackoffConfig {
            kind: "exponential".to_string(),
            base_ms: 1_000,
            cap_ms: 10,
            delay_ms: 0,
        };
        assert!(config.to_policy().is_err());
    }
}
