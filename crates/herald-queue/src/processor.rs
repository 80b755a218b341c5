//! Per-queue consumer loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use herald_common::{truncate_error, HandlerRegistry, ProcessingResult, Result};
use herald_storage::QueueStore;
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct QueueProcessorConfig {
    /// The queue this processor serves.
    pub queue: String,
    /// Poll period when the queue is empty.
    pub tick_interval: Duration,
    /// Max entries claimed per cycle. Bounds a cycle even when handlers
    /// requeue their entries immediately.
    pub batch_size: usize,
}

impl QueueProcessorConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            tick_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Snapshot of processor progress.
#[derive(Debug, Clone, Default)]
pub struct QueueProcessorMetrics {
    pub dispatched: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub backlog: u64,
    pub last_error: Option<String>,
}

pub struct QueueProcessor {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    config: QueueProcessorConfig,
    running: AtomicBool,
    metrics: Mutex<QueueProcessorMetrics>,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
        config: QueueProcessorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            running: AtomicBool::new(false),
            metrics: Mutex::new(QueueProcessorMetrics::default()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> QueueProcessorMetrics {
        self.metrics.lock().clone()
    }

    /// Run until stopped.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(queue = %self.config.queue, "Queue processor already running");
            return;
        }

        info!(
            queue = %self.config.queue,
            tick_interval_ms = %self.config.tick_interval.as_millis(),
            batch_size = %self.config.batch_size,
            "Starting queue processor"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(e) = self.process_once().await {
                error!(queue = %self.config.queue, error = %e, "Queue drain cycle failed");
                self.metrics.lock().last_error = Some(truncate_error(&e.to_string()));
            }
        }

        info!(queue = %self.config.queue, "Queue processor stopped");
    }

    /// Claim and dispatch until the queue runs dry or the batch bound is
    /// hit. Returns the number of entries acknowledged.
    pub async fn process_once(&self) -> Result<usize> {
        let queue = self.config.queue.as_str();
        let depth = self.store.queue_depth(queue).await?;
        metrics::gauge!("herald_queue_backlog", "queue" => self.config.queue.clone())
            .set(depth as f64);
        self.metrics.lock().backlog = depth;

        let mut acknowledged = 0;
        for _ in 0..self.config.batch_size {
            let Some(entry) = self.store.dequeue(queue).await? else {
                break;
            };
            self.metrics.lock().dispatched += 1;
            metrics::counter!("herald_queue_dispatched_total", "queue" => self.config.queue.clone())
                .increment(1);

            // Handler outcomes settle the entry; nothing re-raises into the
            // drain loop.
            match self.registry.dispatch(&entry.message).await {
                Ok(ProcessingResult::Completed) => {
                    self.store.acknowledge(queue, entry.id).await?;
                    self.metrics.lock().acknowledged += 1;
                    acknowledged += 1;
                }
                Ok(ProcessingResult::Retry { reason }) => {
                    debug!(queue = %queue, entry_id = %entry.id, reason = %reason, "Entry requeued");
                    self.store.reject(queue, entry.id, true).await?;
                    self.metrics.lock().requeued += 1;
                }
                Ok(ProcessingResult::Failed { reason }) => {
                    warn!(queue = %queue, entry_id = %entry.id, reason = %reason, "Entry rejected");
                    self.store.reject(queue, entry.id, false).await?;
                    let mut m = self.metrics.lock();
                    m.dropped += 1;
                    m.last_error = Some(truncate_error(&reason));
                }
                Err(e) => {
                    let reason = truncate_error(&e.to_string());
                    let requeue = e.is_retryable();
                    warn!(
                        queue = %queue,
                        entry_id = %entry.id,
                        error = %reason,
                        requeue,
                        "Queue handler raised"
                    );
                    self.store.reject(queue, entry.id, requeue).await?;
                    let mut m = self.metrics.lock();
                    if requeue {
                        m.requeued += 1;
                    } else {
                        m.dropped += 1;
                    }
                    m.last_error = Some(reason);
                }
            }
        }
        Ok(acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let config = QueueProcessorConfig::for_queue("orders");
        assert_eq!(config.queue, "orders");
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 100);
    }
}
