//! Inbox engine: exactly-once-effect consumption from upstream sources.
//!
//! The canonical flow is add-first inside the same transaction as the
//! business update: the ledger row exists iff the business effect exists,
//! and a duplicate arrival is answered with a sentinel so the caller can
//! acknowledge upstream without reprocessing.

pub mod cleanup;
pub mod processor;
pub mod receiver;

pub use cleanup::{InboxCleanupConfig, InboxCleanupTask};
pub use processor::{InboxProcessor, InboxProcessorConfig, InboxProcessorMetrics};
pub use receiver::{receive_transactional, InboxReceiver, ReceiveOutcome};
