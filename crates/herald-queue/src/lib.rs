//! Queue engine: broker-like mailboxes inside one process.
//!
//! The visibility protocol, ordering, TTL and dead-letter routing are
//! enforced by the queue store driver; this crate adds the consumer side, a
//! [`QueueProcessor`] per queue that claims entries, dispatches them through
//! the handler registry and settles them with acknowledge or reject.

pub mod processor;

pub use herald_common::{dlq_name, DLQ_SUFFIX};
pub use processor::{QueueProcessor, QueueProcessorConfig, QueueProcessorMetrics};
