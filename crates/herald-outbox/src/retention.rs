//! Purges settled outbox entries past the retention horizon.
//!
//! Runs apart from the drain loop so cleanup pressure never competes with
//! delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use herald_storage::OutboxStore;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How often to sweep. Default: 1 hour.
    pub sweep_interval: Duration,
    /// Age past which a Processed entry is eligible for purge. Default: 7 days.
    pub retention: Duration,
    /// Whether the task runs at all. Default: true.
    pub enabled: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            enabled: true,
        }
    }
}

/// Background task bounding outbox storage.
pub struct RetentionTask {
    store: Arc<dyn OutboxStore>,
    config: RetentionConfig,
}

impl RetentionTask {
    pub fn new(store: Arc<dyn OutboxStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    /// Run until cancelled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Outbox retention task is disabled");
            return;
        }

        info!(
            "Starting outbox retention task (interval: {:?}, retention: {:?})",
            self.config.sweep_interval, self.config.retention
        );

        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// Perform a single sweep.
    pub async fn run_once(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
        debug!(%cutoff, "Sweeping settled outbox entries");
        match self.store.purge_processed(cutoff).await {
            Ok(count) => {
                if count > 0 {
                    info!("Purged {} settled outbox entries", count);
                }
            }
            Err(e) => {
                error!("Failed to purge settled outbox entries: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RetentionConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
        assert_eq!(config.retention, Duration::from_secs(604_800));
        assert!(config.enabled);
    }
}
