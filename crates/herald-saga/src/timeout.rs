//! Store-driven timeout sweeper.
//!
//! Timeouts are evaluated against persisted state-entry timestamps rather
//! than armed in-memory timers, so they survive restarts.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::definition::SagaData;
use crate::orchestrator::SagaOrchestrator;

#[derive(Debug, Clone)]
pub struct SagaTimeoutSweeperConfig {
    /// How often to scan active instances. Default: 5 seconds.
    pub sweep_interval: Duration,
    /// Max instances examined per sweep.
    pub batch_size: usize,
}

impl Default for SagaTimeoutSweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

pub struct SagaTimeoutSweeper<D: SagaData> {
    orchestrator: Arc<SagaOrchestrator<D>>,
    config: SagaTimeoutSweeperConfig,
}

impl<D: SagaData> SagaTimeoutSweeper<D> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<D>>, config: SagaTimeoutSweeperConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Run until cancelled.
    pub async fn run(&self) {
        info!(
            saga = %self.orchestrator.definition().name(),
            sweep_interval_ms = %self.config.sweep_interval.as_millis(),
            "Starting saga timeout sweeper"
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
        match self.orchestrator.expire_timeouts(self.config.batch_size).await {
            Ok(expired) => {
                if expired > 0 {
                    info!(
                        saga = %self.orchestrator.definition().name(),
                        expired,
                        "Failed timed-out saga instances"
                    );
                }
            }
            Err(e) => {
                error!(
                    saga = %self.orchestrator.definition().name(),
                    error = %e,
                    "Timeout sweep failed"
                );
            }
        }
    }
}
