//! Store contracts.
//!
//! Every operation is asynchronous and cancel-safe; dropping the returned
//! future aborts before the state change commits. State transitions are
//! single-writer per identifier: drivers reject conflicting transitions and
//! treat a repeated terminal transition as an idempotent no-op returning
//! `true`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::{
    EnqueueOptions, HeraldError, InboxEntry, Message, OutboxEntry, PublishOptions, QueueEntry,
    QueueOptions, ReceiveOptions, Result,
};
use std::time::Duration;
use uuid::Uuid;

use crate::query::{InboxQuery, MessageFilter, OutboxQuery};

/// Options for `MessageStore::store`.
#[derive(Debug, Clone)]
pub struct StoreMessageOptions {
    pub collection: String,
}

impl Default for StoreMessageOptions {
    fn default() -> Self {
        Self {
            collection: "messages".to_string(),
        }
    }
}

/// General-purpose message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. Fails with Conflict when the identifier exists.
    async fn store(&self, message: &Message, options: Option<StoreMessageOptions>) -> Result<Uuid>;

    /// Fetch by identifier; `None` when absent.
    async fn retrieve(&self, id: Uuid) -> Result<Option<Message>>;

    /// Bounded query; see [`MessageFilter`].
    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>>;

    /// Replace a stored message. Returns `false` when the id is absent.
    async fn update(&self, id: Uuid, message: &Message) -> Result<bool>;

    /// Returns `false` when the id is absent.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn exists(&self, id: Uuid) -> Result<bool>;

    /// Count matching messages, ignoring offset and limit.
    async fn count(&self, filter: Option<&MessageFilter>) -> Result<u64>;

    async fn clear(&self) -> Result<()>;
}

/// Convenience lookups that require presence.
#[async_trait]
pub trait MessageStoreExt: MessageStore {
    async fn retrieve_required(&self, id: Uuid) -> Result<Message> {
        self.retrieve(id)
            .await?
            .ok_or_else(|| HeraldError::NotFound(format!("message {}", id)))
    }
}

impl<T: MessageStore + ?Sized> MessageStoreExt for T {}

/// Durable send buffer co-committed with business data.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a Pending entry. Options are validated synchronously.
    async fn add(&self, message: &Message, options: &PublishOptions) -> Result<OutboxEntry>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>>;

    /// Pending entries whose next retry is due, oldest first.
    async fn get_pending(&self, query: &OutboxQuery) -> Result<Vec<OutboxEntry>>;

    /// Claim an entry for delivery. `false` when another drain won the race
    /// or the entry is already settled.
    async fn mark_processing(&self, id: Uuid) -> Result<bool>;

    /// Terminal. Repeating on a Processed entry is a no-op returning `true`.
    async fn mark_processed(&self, id: Uuid) -> Result<bool>;

    /// Terminal. Repeating on a Failed entry is a no-op returning `true`.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool>;

    /// Record a retry and schedule the next attempt. The count is
    /// non-decreasing and bounded by the entry's max retries.
    async fn update_retry_count(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn pending_count(&self) -> Result<u64>;

    async fn get_failed(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Remove Processed entries settled before the cutoff. Returns the
    /// number purged.
    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait OutboxStoreExt: OutboxStore {
    async fn get_pending_batch(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.get_pending(&OutboxQuery::with_limit(limit)).await
    }
}

impl<T: OutboxStore + ?Sized> OutboxStoreExt for T {}

/// Durable dedup ledger for consumed messages.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Add-first entry point. Returns `None` when the message identifier is
    /// already present inside the dedup window and the options require
    /// idempotency; a duplicate without that flag is a Conflict.
    async fn add(&self, message: &Message, options: &ReceiveOptions) -> Result<Option<InboxEntry>>;

    async fn is_duplicate(&self, message_id: Uuid, window: Duration) -> Result<bool>;

    async fn get(&self, message_id: Uuid) -> Result<Option<InboxEntry>>;

    /// Claim an entry for handling; `false` when another processor won.
    async fn mark_processing(&self, message_id: Uuid) -> Result<bool>;

    async fn mark_processed(&self, message_id: Uuid) -> Result<bool>;

    async fn mark_failed(&self, message_id: Uuid, error: &str) -> Result<bool>;

    /// Return a claimed entry to Pending so a later tick can retry it.
    async fn release(&self, message_id: Uuid) -> Result<bool>;

    async fn get_pending(&self, query: &InboxQuery) -> Result<Vec<InboxEntry>>;

    async fn get_unprocessed(&self, limit: usize) -> Result<Vec<InboxEntry>>;

    async fn unprocessed_count(&self) -> Result<u64>;

    /// Remove settled entries received before the cutoff, bounding the
    /// ledger. Returns the number removed.
    async fn cleanup_old_entries(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Named queues with visibility-timeout semantics.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append to a queue, creating it lazily with default options. Fails
    /// with QueueFull when the queue has a max size and is at it.
    async fn enqueue(
        &self,
        queue: &str,
        message: &Message,
        options: Option<EnqueueOptions>,
    ) -> Result<QueueEntry>;

    /// Claim the next eligible entry: hides it for the visibility timeout
    /// and increments its dequeue count. An entry past the queue's max
    /// dequeue count is moved to the `.dlq` sibling and still returned so
    /// the caller observes the routing.
    async fn dequeue(&self, queue: &str) -> Result<Option<QueueEntry>>;

    /// Next eligible entries without claiming them.
    async fn peek(&self, queue: &str, count: usize) -> Result<Vec<QueueEntry>>;

    /// Remove a claimed entry. `false` when it is no longer present.
    async fn acknowledge(&self, queue: &str, entry_id: Uuid) -> Result<bool>;

    /// With `requeue` the entry becomes immediately visible again, priority
    /// unchanged; without it the entry is dropped, or dead-lettered when its
    /// dequeue count is exhausted.
    async fn reject(&self, queue: &str, entry_id: Uuid, requeue: bool) -> Result<bool>;

    async fn queue_depth(&self, queue: &str) -> Result<u64>;

    async fn create_queue(&self, queue: &str, options: QueueOptions) -> Result<()>;

    /// Removes the queue and every contained entry.
    async fn delete_queue(&self, queue: &str) -> Result<bool>;

    async fn get_queues(&self) -> Result<Vec<String>>;

    async fn queue_exists(&self, queue: &str) -> Result<bool>;
}
