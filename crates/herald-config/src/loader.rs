//! Locates the configuration file and layers `HERALD_*` environment
//! overrides on top of it.
//!
//! Overrides are table-driven: one row per recognized variable, each with a
//! setter that reports whether the raw value parsed. Unparseable values are
//! logged and skipped rather than silently defaulted.

use crate::{ConfigError, HeraldConfig};
use herald_common::IsolationLevel;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Search order when no explicit path is given.
const CONFIG_PATHS: &[&str] = &[
    "herald.toml",
    "config.toml",
    "./config/herald.toml",
    "/etc/herald/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Prefer a specific file over the search paths.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// File settings (when a file is found) under environment overrides,
    /// validated as a whole.
    pub fn load(&self) -> Result<HeraldConfig, ConfigError> {
        let mut config = match self.resolve_path() {
            Some(path) => {
                info!(?path, "Loading configuration file");
                HeraldConfig::from_file(&path)?
            }
            None => HeraldConfig::default(),
        };
        apply_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Explicit path, then `HERALD_CONFIG`, then the standard locations;
    /// the first existing file wins.
    fn resolve_path(&self) -> Option<PathBuf> {
        self.config_path
            .clone()
            .into_iter()
            .chain(env::var("HERALD_CONFIG").ok().map(PathBuf::from))
            .chain(CONFIG_PATHS.iter().map(PathBuf::from))
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

type Setter = fn(&mut HeraldConfig, &str) -> bool;

fn override_table() -> Vec<(&'static str, Setter)> {
    vec![
        // Outbox
        ("HERALD_OUTBOX_BATCH_SIZE", |c, v| {
            set(&mut c.outbox.batch_size, v)
        }),
        ("HERALD_OUTBOX_TICK_INTERVAL_MS", |c, v| {
            set(&mut c.outbox.tick_interval_ms, v)
        }),
        ("HERALD_OUTBOX_MAX_RETRIES", |c, v| {
            set(&mut c.outbox.max_retries, v)
        }),
        ("HERALD_OUTBOX_BACKOFF_KIND", |c, v| {
            // Validity is checked with the rest of the config.
            c.outbox.backoff.kind = v.to_string();
            true
        }),
        ("HERALD_OUTBOX_BACKOFF_BASE_MS", |c, v| {
            set(&mut c.outbox.backoff.base_ms, v)
        }),
        ("HERALD_OUTBOX_BACKOFF_CAP_MS", |c, v| {
            set(&mut c.outbox.backoff.cap_ms, v)
        }),
        ("HERALD_OUTBOX_BACKOFF_DELAY_MS", |c, v| {
            set(&mut c.outbox.backoff.delay_ms, v)
        }),
        // Inbox
        ("HERALD_INBOX_DEDUP_WINDOW_SECS", |c, v| {
            set(&mut c.inbox.dedup_window_secs, v)
        }),
        ("HERALD_INBOX_STALE_GRACE_SECS", |c, v| {
            set(&mut c.inbox.stale_grace_secs, v)
        }),
        ("HERALD_INBOX_BATCH_SIZE", |c, v| {
            set(&mut c.inbox.batch_size, v)
        }),
        ("HERALD_INBOX_TICK_INTERVAL_MS", |c, v| {
            set(&mut c.inbox.tick_interval_ms, v)
        }),
        // Queue defaults
        ("HERALD_QUEUE_VISIBILITY_TIMEOUT_SECS", |c, v| {
            set(&mut c.queue.visibility_timeout_secs, v)
        }),
        ("HERALD_QUEUE_MAX_DEQUEUE_COUNT", |c, v| {
            set_some(&mut c.queue.max_dequeue_count, v)
        }),
        ("HERALD_QUEUE_MAX_SIZE", |c, v| {
            set_some(&mut c.queue.max_size, v)
        }),
        ("HERALD_QUEUE_MESSAGE_TTL_SECS", |c, v| {
            set_some(&mut c.queue.message_ttl_secs, v)
        }),
        ("HERALD_QUEUE_PRIORITY_ENABLED", |c, v| {
            set(&mut c.queue.priority_enabled, v)
        }),
        // Unit of work
        ("HERALD_UOW_DEFAULT_ISOLATION", |c, v| {
            set_isolation(&mut c.uow.default_isolation, v)
        }),
        // Retention
        ("HERALD_RETENTION_OUTBOX_SECS", |c, v| {
            set(&mut c.retention.outbox_secs, v)
        }),
        ("HERALD_RETENTION_INBOX_SECS", |c, v| {
            set(&mut c.retention.inbox_secs, v)
        }),
        ("HERALD_RETENTION_SWEEP_INTERVAL_SECS", |c, v| {
            set(&mut c.retention.sweep_interval_secs, v)
        }),
    ]
}

fn apply_overrides(config: &mut HeraldConfig, lookup: impl Fn(&str) -> Option<String>) {
    for (key, setter) in override_table() {
        let Some(raw) = lookup(key) else { continue };
        if !setter(config, &raw) {
            warn!(key, value = %raw, "Ignoring override with unparseable value");
        }
    }
}

fn set<T: FromStr>(slot: &mut T, raw: &str) -> bool {
    match raw.parse() {
        Ok(value) => {
            *slot = value;
            true
        }
        Err(_) => false,
    }
}

fn set_some<T: FromStr>(slot: &mut Option<T>, raw: &str) -> bool {
    match raw.parse() {
        Ok(value) => {
            *slot = Some(value);
            true
        }
        Err(_) => false,
    }
}

fn set_isolation(slot: &mut IsolationLevel, raw: &str) -> bool {
    let level = match raw.to_ascii_lowercase().as_str() {
        "read_uncommitted" => IsolationLevel::ReadUncommitted,
        "read_committed" => IsolationLevel::ReadCommitted,
        "repeatable_read" => IsolationLevel::RepeatableRead,
        "serializable" => IsolationLevel::Serializable,
        _ => return false,
    };
    *slot = level;
    true
}
