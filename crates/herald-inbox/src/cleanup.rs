//! Bounds the dedup ledger by removing settled entries past retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use herald_storage::InboxStore;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct InboxCleanupConfig {
    /// How often to sweep. Default: 1 hour.
    pub sweep_interval: Duration,
    /// Age past which a settled entry is removed. Should comfortably exceed
    /// the longest dedup window in use. Default: 7 days.
    pub retention: Duration,
    /// Whether the task runs at all. Default: true.
    pub enabled: bool,
}

impl Default for InboxCleanupConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            enabled: true,
        }
    }
}

pub struct InboxCleanupTask {
    store: Arc<dyn InboxStore>,
    config: InboxCleanupConfig,
}

impl InboxCleanupTask {
    pub fn new(store: Arc<dyn InboxStore>, config: InboxCleanupConfig) -> Self {
        Self { store, config }
    }

    /// Run until cancelled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Inbox cleanup task is disabled");
            return;
        }

        info!(
            "Starting inbox cleanup task (interval: {:?}, retention: {:?})",
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
        debug!(%cutoff, "Sweeping settled inbox entries");
        match self.store.cleanup_old_entries(cutoff).await {
            Ok(count) => {
                if count > 0 {
                    info!("Removed {} settled inbox entries", count);
                }
            }
            Err(e) => {
                error!("Failed to clean up inbox entries: {}", e);
            }
        }
    }
}
