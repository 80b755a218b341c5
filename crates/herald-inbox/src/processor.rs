//! Background drain for stale Pending inbox entries.
//!
//! The canonical transactional flow settles entries inline; this processor
//! is the safety net that picks up entries left Pending longer than the
//! grace period (a crashed consumer, a handler registered late) and runs
//! them through the handler registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use herald_common::{truncate_error, HandlerRegistry, ProcessingResult, Result};
use herald_storage::{InboxQuery, InboxStore};
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct InboxProcessorConfig {
    /// Drain period.
    pub tick_interval: Duration,
    /// Max entries fetched per cycle.
    pub batch_size: usize,
    /// Age a Pending entry must reach before the processor picks it up.
    pub stale_grace: Duration,
}

impl Default for InboxProcessorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            batch_size: 100,
            stale_grace: Duration::from_secs(60),
        }
    }
}

/// Snapshot of processor progress.
#[derive(Debug, Clone, Default)]
pub struct InboxProcessorMetrics {
    pub polled: u64,
    pub processed: u64,
    pub failed: u64,
    pub released: u64,
    pub backlog: u64,
    pub last_error: Option<String>,
}

pub struct InboxProcessor {
    store: Arc<dyn InboxStore>,
    registry: Arc<HandlerRegistry>,
    config: InboxProcessorConfig,
    running: AtomicBool,
    metrics: Mutex<InboxProcessorMetrics>,
}

impl InboxProcessor {
    pub fn new(
        store: Arc<dyn InboxStore>,
        registry: Arc<HandlerRegistry>,
        config: InboxProcessorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            running: AtomicBool::new(false),
            metrics: Mutex::new(InboxProcessorMetrics::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> InboxProcessorMetrics {
        self.metrics.lock().clone()
    }

    /// Run until stopped.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Inbox processor already running");
            return;
        }

        info!(
            tick_interval_ms = %self.config.tick_interval.as_millis(),
            batch_size = %self.config.batch_size,
            stale_grace_ms = %self.config.stale_grace.as_millis(),
            "Starting inbox processor"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(e) = self.process_once().await {
                error!(error = %e, "Inbox drain cycle failed");
                self.metrics.lock().last_error = Some(truncate_error(&e.to_string()));
            }
        }

        info!("Inbox processor stopped");
    }

    /// One drain cycle. Returns the number of entries settled as Processed.
    pub async fn process_once(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_grace)
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let query = InboxQuery {
            source: None,
            received_before: Some(cutoff),
            limit: self.config.batch_size,
        };
        let entries = self.store.get_pending(&query).await?;
        let backlog = self.store.unprocessed_count().await?;
        metrics::gauge!("herald_inbox_backlog").set(backlog as f64);
        {
            let mut m = self.metrics.lock();
            m.backlog = backlog;
            m.polled += entries.len() as u64;
        }

        if entries.is_empty() {
            return Ok(0);
        }
        debug!(count = entries.len(), "Draining stale inbox entries");

        let mut settled = 0;
        for entry in entries {
            if !self.store.mark_processing(entry.id).await? {
                continue;
            }

            // Handler outcomes become per-entry transitions; nothing
            // re-raises into the drain loop.
            match self.registry.dispatch(&entry.message).await {
                Ok(ProcessingResult::Completed) => {
                    self.store.mark_processed(entry.id).await?;
                    metrics::counter!("herald_inbox_processed_total").increment(1);
                    self.metrics.lock().processed += 1;
                    settled += 1;
                }
                Ok(ProcessingResult::Retry { reason }) => {
                    self.store.release(entry.id).await?;
                    debug!(entry_id = %entry.id, reason = %reason, "Inbox entry released for retry");
                    self.metrics.lock().released += 1;
                }
                Ok(ProcessingResult::Failed { reason }) => {
                    self.store.mark_failed(entry.id, &reason).await?;
                    warn!(entry_id = %entry.id, reason = %reason, "Inbox entry failed");
                    metrics::counter!("herald_inbox_failed_total").increment(1);
                    let mut m = self.metrics.lock();
                    m.failed += 1;
                    m.last_error = Some(truncate_error(&reason));
                }
                Err(e) => {
                    let reason = truncate_error(&e.to_string());
                    self.store.mark_failed(entry.id, &reason).await?;
                    warn!(entry_id = %entry.id, error = %reason, "Inbox handler raised");
                    metrics::counter!("herald_inbox_failed_total").increment(1);
                    let mut m = self.metrics.lock();
                    m.failed += 1;
                    m.last_error = Some(reason);
                }
            }
        }
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = InboxProcessorConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.stale_grace, Duration::from_secs(60));
    }
}
