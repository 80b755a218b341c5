//! Receive-side entry points.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use herald_common::{InboxEntry, Message, ReceiveOptions, Result};
use herald_storage::{InboxStore, TransactionExecutor, UnitOfWork};
use tracing::debug;
use uuid::Uuid;

/// What happened to an incoming message.
#[derive(Debug, Clone)]
pub enum ReceiveOutcome {
    /// A fresh ledger entry was recorded.
    Accepted(InboxEntry),
    /// The identifier was already inside the dedup window; acknowledge
    /// upstream without reprocessing.
    Duplicate,
}

impl ReceiveOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ReceiveOutcome::Duplicate)
    }
}

/// Thin facade over an inbox store for the two receive modes.
pub struct InboxReceiver {
    store: Arc<dyn InboxStore>,
}

impl InboxReceiver {
    pub fn new(store: Arc<dyn InboxStore>) -> Self {
        Self { store }
    }

    /// Add-first mode: record the identifier, then process.
    pub async fn receive(
        &self,
        message: &Message,
        options: &ReceiveOptions,
    ) -> Result<ReceiveOutcome> {
        match self.store.add(message, options).await? {
            Some(entry) => Ok(ReceiveOutcome::Accepted(entry)),
            None => {
                debug!(message_id = %message.id, "Duplicate arrival skipped");
                Ok(ReceiveOutcome::Duplicate)
            }
        }
    }

    /// Decide-then-process mode: check before doing any work.
    pub async fn is_duplicate(&self, message_id: Uuid, window: Duration) -> Result<bool> {
        self.store.is_duplicate(message_id, window).await
    }
}

/// The canonical consume flow: add-first inside one transaction with the
/// business effect. On a duplicate nothing runs; on a handler error the
/// whole transaction rolls back, so upstream redelivery reprocesses from
/// scratch; on success the ledger row commits as Processed together with
/// whatever the handler wrote through the unit of work.
pub async fn receive_transactional<F, Fut>(
    executor: &TransactionExecutor,
    message: &Message,
    options: &ReceiveOptions,
    handler: F,
) -> Result<ReceiveOutcome>
where
    F: FnOnce(Arc<dyn UnitOfWork>) -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    let message = message.clone();
    let options = options.clone();
    executor
        .execute("inbox.receive", move |uow| async move {
            let inbox = uow.inbox_store();
            let Some(entry) = inbox.add(&message, &options).await? else {
                return Ok(ReceiveOutcome::Duplicate);
            };
            inbox.mark_processing(entry.id).await?;
            handler(Arc::clone(&uow)).await?;
            inbox.mark_processed(entry.id).await?;
            Ok(ReceiveOutcome::Accepted(entry))
        })
        .await
}
