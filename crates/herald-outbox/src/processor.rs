//! Background drain for the outbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use herald_common::{truncate_error, OutboxEntry, Result};
use herald_storage::{OutboxQuery, OutboxStore};
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    /// Drain period.
    pub tick_interval: Duration,
    /// Max entries fetched per drain cycle.
    pub batch_size: usize,
    /// Restrict the drain to one destination; `None` drains everything.
    pub destination: Option<String>,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            batch_size: 100,
            destination: None,
        }
    }
}

/// Snapshot of processor progress.
#[derive(Debug, Clone, Default)]
pub struct OutboxProcessorMetrics {
    pub polled: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
    pub backlog: u64,
    pub last_error: Option<String>,
}

/// Drains visible Pending entries: claim, send, settle. Claims go through
/// the store's compare-and-set so multiple drains cooperate without
/// in-process locks.
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn Transport>,
    config: OutboxProcessorConfig,
    running: AtomicBool,
    metrics: Mutex<OutboxProcessorMetrics>,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn Transport>,
        config: OutboxProcessorConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            running: AtomicBool::new(false),
            metrics: Mutex::new(OutboxProcessorMetrics::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> OutboxProcessorMetrics {
        self.metrics.lock().clone()
    }

    /// Run until stopped. One drain is in flight at a time; a tick that
    /// lands mid-drain is skipped.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Outbox processor already running");
            return;
        }

        info!(
            tick_interval_ms = %self.config.tick_interval.as_millis(),
            batch_size = %self.config.batch_size,
            "Starting outbox processor"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(e) = self.process_once().await {
                error!(error = %e, "Outbox drain cycle failed");
                self.metrics.lock().last_error = Some(truncate_error(&e.to_string()));
            }
        }

        info!("Outbox processor stopped");
    }

    /// One drain cycle. Returns the number of entries delivered.
    pub async fn process_once(&self) -> Result<usize> {
        let query = OutboxQuery {
            destination: self.config.destination.clone(),
            limit: self.config.batch_size,
        };
        let entries = self.store.get_pending(&query).await?;
        let backlog = self.store.pending_count().await?;
        metrics::gauge!("herald_outbox_backlog").set(backlog as f64);
        {
            let mut m = self.metrics.lock();
            m.backlog = backlog;
            m.polled += entries.len() as u64;
        }

        if entries.is_empty() {
            return Ok(0);
        }
        debug!(count = entries.len(), "Draining outbox entries");

        let mut delivered = 0;
        for entry in entries {
            // Claim; skip entries another drain got to first.
            if !self.store.mark_processing(entry.id).await? {
                continue;
            }

            match self
                .transport
                .send(&entry.options.destination, &entry.message)
                .await
            {
                Ok(()) => {
                    self.store.mark_processed(entry.id).await?;
                    metrics::counter!("herald_outbox_delivered_total").increment(1);
                    self.metrics.lock().delivered += 1;
                    delivered += 1;
                }
                Err(e) => {
                    self.handle_failure(&entry, &e.to_string()).await?;
                }
            }
        }
        Ok(delivered)
    }

    async fn handle_failure(&self, entry: &OutboxEntry, error: &str) -> Result<()> {
        let next = entry.retry_count + 1;
        let reason = truncate_error(error);

        if next > entry.options.max_retries {
            self.store.mark_failed(entry.id, &reason).await?;
            self.record_entry_failed(entry, next, &reason);
        } else if next == entry.options.max_retries {
            // Record the final attempt, then settle the entry.
            self.store.update_retry_count(entry.id, next, None).await?;
            self.store.mark_failed(entry.id, &reason).await?;
            self.record_entry_failed(entry, next, &reason);
        } else {
            let delay = entry.options.backoff.delay_for(next);
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::days(36_500));
            self.store
                .update_retry_count(entry.id, next, Some(next_retry_at))
                .await?;
            debug!(
                entry_id = %entry.id,
                retry = next,
                delay_ms = %delay.as_millis(),
                error = %reason,
                "Outbox delivery failed, retry scheduled"
            );
            metrics::counter!("herald_outbox_retried_total").increment(1);
            let mut m = self.metrics.lock();
            m.retried += 1;
            m.last_error = Some(reason);
        }
        Ok(())
    }

    fn record_entry_failed(&self, entry: &OutboxEntry, attempts: u32, reason: &str) {
        warn!(
            entry_id = %entry.id,
            destination = %entry.options.destination,
            attempts,
            error = %reason,
            "Outbox entry failed permanently"
        );
        metrics::counter!("herald_outbox_failed_total").increment(1);
        let mut m = self.metrics.lock();
        m.failed += 1;
        m.last_error = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = OutboxProcessorConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert!(config.destination.is_none());
    }
}
