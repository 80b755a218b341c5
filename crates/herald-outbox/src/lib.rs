//! Outbox engine: durable send buffer drained to a transport.
//!
//! Producers add entries through an outbox store handle inside the same
//! unit of work as their business data, so either both persist or neither
//! does. The [`OutboxProcessor`] drains visible Pending entries, hands them
//! to the configured [`Transport`] and schedules retries with the entry's
//! backoff policy. A separate [`RetentionTask`] purges settled entries.

pub mod processor;
pub mod retention;
pub mod transport;

pub use processor::{OutboxProcessor, OutboxProcessorConfig, OutboxProcessorMetrics};
pub use retention::{RetentionConfig, RetentionTask};
pub use transport::Transport;
