use async_trait::async_trait;
use herald_common::{Message, Result};

/// Abstract delivery boundary. Concrete wire transports and their
/// serializers live behind this contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message to a named destination. An error schedules a
    /// retry; delivery is at-least-once, so receivers deduplicate.
    async fn send(&self, destination: &str, message: &Message) -> Result<()>;

    /// Liveness signal surfaced by the health probes.
    fn is_healthy(&self) -> bool {
        true
    }
}
