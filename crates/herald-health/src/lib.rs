//! Read-only health probes over the stores and engines.
//!
//! Each probe returns a status, a human description and a data map; the
//! registry composes them and the aggregate status is the worst individual
//! one. Probes never raise: a failing dependency is reported as Unhealthy.

use async_trait::async_trait;
use herald_common::Message;
use herald_outbox::Transport;
use herald_storage::{InboxStore, MessageStore, OutboxStore, OutboxStoreExt, QueueStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Probe outcome severity, worst last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One probe's result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub description: String,
    pub data: HashMap<String, serde_json::Value>,
}

impl HealthCheckResult {
    pub fn healthy(description: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, description)
    }

    pub fn degraded(description: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, description)
    }

    pub fn unhealthy(description: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy, description)
    }

    fn with_status(status: HealthStatus, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> HealthCheckResult;
}

/// Backlog counts mapped to severity.
#[derive(Debug, Clone, Copy)]
pub struct BacklogThresholds {
    /// At or above this count the component is Degraded.
    pub degraded: u64,
    /// At or above this count the component is Unhealthy.
    pub unhealthy: u64,
}

impl Default for BacklogThresholds {
    fn default() -> Self {
        Self {
            degraded: 100,
            unhealthy: 1_000,
        }
    }
}

impl BacklogThresholds {
    fn classify(&self, backlog: u64) -> HealthStatus {
        if backlog >= self.unhealthy {
            HealthStatus::Unhealthy
        } else if backlog >= self.degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

// ============================================================================
// Concrete probes
// ============================================================================

/// Write-read-delete round trip through the message store.
pub struct MessageStoreCheck {
    store: Arc<dyn MessageStore>,
}

impl MessageStoreCheck {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    async fn round_trip(&self) -> herald_common::Result<()> {
        let probe = Message::event("health.probe", serde_json::json!({}));
        let id = self.store.store(&probe, None).await?;
        let read = self.store.retrieve(id).await?;
        self.store.delete(id).await?;
        if read.is_none() {
            return Err(herald_common::HeraldError::NotFound(
                "probe message vanished between write and read".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for MessageStoreCheck {
    fn name(&self) -> &str {
        "message-store"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.round_trip().await {
            Ok(()) => HealthCheckResult::healthy("write-read-delete round trip succeeded"),
            Err(e) => HealthCheckResult::unhealthy(format!("round trip failed: {}", e))
                .with_data("last_error", serde_json::json!(e.to_string())),
        }
    }
}

/// Outbox reachability plus backlog thresholds.
pub struct OutboxCheck {
    store: Arc<dyn OutboxStore>,
    thresholds: BacklogThresholds,
}

impl OutboxCheck {
    pub fn new(store: Arc<dyn OutboxStore>, thresholds: BacklogThresholds) -> Self {
        Self { store, thresholds }
    }
}

#[async_trait]
impl HealthCheck for OutboxCheck {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn check(&self) -> HealthCheckResult {
        if let Err(e) = self.store.get_pending_batch(1).await {
            return HealthCheckResult::unhealthy(format!("outbox unreachable: {}", e))
                .with_data("last_error", serde_json::json!(e.to_string()));
        }
        match self.store.pending_count().await {
            Ok(backlog) => {
                let status = self.thresholds.classify(backlog);
                HealthCheckResult::with_status(
                    status,
                    format!("{} pending entries", backlog),
                )
                .with_data("pending_count", serde_json::json!(backlog))
            }
            Err(e) => HealthCheckResult::unhealthy(format!("outbox unreachable: {}", e))
                .with_data("last_error", serde_json::json!(e.to_string())),
        }
    }
}

/// Inbox reachability plus unprocessed backlog thresholds.
pub struct InboxCheck {
    store: Arc<dyn InboxStore>,
    thresholds: BacklogThresholds,
}

impl InboxCheck {
    pub fn new(store: Arc<dyn InboxStore>, thresholds: BacklogThresholds) -> Self {
        Self { store, thresholds }
    }
}

#[async_trait]
impl HealthCheck for InboxCheck {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.store.unprocessed_count().await {
            Ok(backlog) => {
                let status = self.thresholds.classify(backlog);
                HealthCheckResult::with_status(
                    status,
                    format!("{} unprocessed entries", backlog),
                )
                .with_data("unprocessed_count", serde_json::json!(backlog))
            }
            Err(e) => HealthCheckResult::unhealthy(format!("inbox unreachable: {}", e))
                .with_data("last_error", serde_json::json!(e.to_string())),
        }
    }
}

/// Depth of one queue mapped to severity.
pub struct QueueCheck {
    store: Arc<dyn QueueStore>,
    queue: String,
    thresholds: BacklogThresholds,
}

impl QueueCheck {
    pub fn new(
        store: Arc<dyn QueueStore>,
        queue: impl Into<String>,
        thresholds: BacklogThresholds,
    ) -> Self {
        Self {
            store,
            queue: queue.into(),
            thresholds,
        }
    }
}

#[async_trait]
impl HealthCheck for QueueCheck {
    fn name(&self) -> &str {
        "queue"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.store.queue_depth(&self.queue).await {
            Ok(depth) => {
                let status = self.thresholds.classify(depth);
                HealthCheckResult::with_status(
                    status,
                    format!("queue '{}' holds {} entries", self.queue, depth),
                )
                .with_data("queue", serde_json::json!(self.queue))
                .with_data("queue_depth", serde_json::json!(depth))
            }
            Err(e) => HealthCheckResult::unhealthy(format!(
                "queue '{}' unreachable: {}",
                self.queue, e
            ))
            .with_data("last_error", serde_json::json!(e.to_string())),
        }
    }
}

/// Transport liveness.
pub struct TransportCheck {
    transport: Arc<dyn Transport>,
}

impl TransportCheck {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl HealthCheck for TransportCheck {
    fn name(&self) -> &str {
        "transport"
    }

    async fn check(&self) -> HealthCheckResult {
        if self.transport.is_healthy() {
            HealthCheckResult::healthy("transport reports healthy")
        } else {
            HealthCheckResult::unhealthy("transport reports unhealthy")
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Composed health over every registered probe.
#[derive(Debug, Serialize)]
pub struct AggregateHealth {
    pub status: HealthStatus,
    pub results: Vec<(String, HealthCheckResult)>,
}

#[derive(Default)]
pub struct HealthRegistry {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    pub fn register(&mut self, check: Arc<dyn HealthCheck>) -> &mut Self {
        self.checks.push(check);
        self
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every probe; the aggregate is the maximum severity seen. An
    /// empty registry reports Healthy.
    pub async fn check_all(&self) -> AggregateHealth {
        let mut results = Vec::with_capacity(self.checks.len());
        let mut status = HealthStatus::Healthy;
        for check in &self.checks {
            let result = check.check().await;
            debug!(probe = %check.name(), status = ?result.status, "Health probe completed");
            status = status.max(result.status);
            results.push((check.name().to_string(), result));
        }
        AggregateHealth { status, results }
    }
}
