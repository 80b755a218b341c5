//! Store handles over the shared state.
//!
//! A handle is either direct (auto-commit: every operation takes the write
//! lock, mutates, releases) or scoped to a unit of work (operations run
//! against the transaction's working copy and are logged for replay at
//! commit). The same guarded transition functions back both paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::{
    EnqueueOptions, HeraldError, InboxEntry, InboxStatus, Message, OutboxEntry, OutboxStatus,
    PublishOptions, QueueEntry, QueueOptions, ReceiveOptions, Result,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::query::{bounded_limit, InboxQuery, MessageFilter, OrderKey, OutboxQuery, SortDirection};
use crate::stores::{InboxStore, MessageStore, OutboxStore, QueueStore, StoreMessageOptions};

use super::state::{self, DbState, StoredMessage};
use super::unit_of_work::{RedoOp, TxCell};

#[derive(Clone)]
pub(crate) struct MemoryConn {
    shared: Arc<RwLock<DbState>>,
    tx: Option<Arc<TxCell>>,
}

impl MemoryConn {
    pub fn direct(shared: Arc<RwLock<DbState>>) -> Self {
        Self { shared, tx: None }
    }

    pub fn scoped(shared: Arc<RwLock<DbState>>, tx: Arc<TxCell>) -> Self {
        Self {
            shared,
            tx: Some(tx),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&DbState) -> Result<R>) -> Result<R> {
        if let Some(cell) = &self.tx {
            let guard = cell.lock();
            if let Some(tx) = guard.as_ref() {
                return f(&tx.working);
            }
        }
        let guard = self.shared.read();
        f(&guard)
    }

    /// Deterministic mutation: applied to the working copy and logged as-is
    /// for replay, or applied directly in auto-commit mode.
    fn write<R, F>(&self, f: F) -> Result<R>
    where
        F: Fn(&mut DbState) -> Result<R> + Send + 'static,
    {
        if let Some(cell) = &self.tx {
            let mut guard = cell.lock();
            if let Some(tx) = guard.as_mut() {
                let result = f(&mut tx.working)?;
                tx.redo.push(Box::new(move |s| f(s).map(|_| ())));
                return Ok(result);
            }
        }
        let mut guard = self.shared.write();
        f(&mut guard)
    }

    /// Mutation whose replay differs from its first application (e.g. a
    /// dequeue selects on the working copy but replays a claim by id).
    fn write_with<R>(
        &self,
        apply: impl FnOnce(&mut DbState) -> Result<(R, Option<RedoOp>)>,
    ) -> Result<R> {
        if let Some(cell) = &self.tx {
            let mut guard = cell.lock();
            if let Some(tx) = guard.as_mut() {
                let (result, op) = apply(&mut tx.working)?;
                if let Some(op) = op {
                    tx.redo.push(op);
                }
                return Ok(result);
            }
        }
        let mut guard = self.shared.write();
        apply(&mut guard).map(|(result, _)| result)
    }
}

// ============================================================================
// Message store
// ============================================================================

pub(crate) struct MemoryMessageStore {
    conn: MemoryConn,
}

impl MemoryMessageStore {
    pub fn new(conn: MemoryConn) -> Self {
        Self { conn }
    }
}

fn filter_matches(stored: &StoredMessage, filter: &MessageFilter) -> bool {
    if let Some(collection) = &filter.collection {
        if &stored.collection != collection {
            return false;
        }
    }
    let ts = stored.message.timestamp;
    if let Some(from) = filter.from {
        if ts < from {
            return false;
        }
    }
    if let Some(to) = filter.to {
        if ts >= to {
            return false;
        }
    }
    for (key, value) in &filter.metadata {
        if stored.message.metadata.get(key) != Some(value) {
            return false;
        }
    }
    if let Some(text) = &filter.text {
        if !stored.message.message_type.contains(text.as_str())
            && !stored.message.payload.to_string().contains(text.as_str())
        {
            return false;
        }
    }
    true
}

fn sort_messages(messages: &mut [Message], order_by: OrderKey, direction: SortDirection) {
    messages.sort_by(|a, b| {
        let ordering = match order_by {
            OrderKey::Timestamp => a.timestamp.cmp(&b.timestamp),
            OrderKey::MessageType => a.message_type.cmp(&b.message_type),
        };
        match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, message: &Message, options: Option<StoreMessageOptions>) -> Result<Uuid> {
        let stored = StoredMessage {
            message: message.clone(),
            collection: options.unwrap_or_default().collection,
            stored_at: Utc::now(),
        };
        let id = stored.message.id;
        self.conn
            .write(move |state| state::message_insert(state, stored.clone()))?;
        Ok(id)
    }

    async fn retrieve(&self, id: Uuid) -> Result<Option<Message>> {
        self.conn
            .read(|state| Ok(state.messages.get(&id).map(|m| m.message.clone())))
    }

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let limit = bounded_limit(filter.limit)?;
        self.conn.read(|state| {
            let mut matches: Vec<Message> = state
                .messages
                .values()
                .filter(|m| filter_matches(m, filter))
                .map(|m| m.message.clone())
                .collect();
            sort_messages(&mut matches, filter.order_by, filter.direction);
            Ok(matches
                .into_iter()
                .skip(filter.offset)
                .take(limit)
                .collect())
        })
    }

    async fn update(&self, id: Uuid, message: &Message) -> Result<bool> {
        let message = message.clone();
        self.conn
            .write(move |state| state::message_update(state, id, message.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.conn.write(move |state| state::message_delete(state, id))
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        self.conn.read(|state| Ok(state.messages.contains_key(&id)))
    }

    async fn count(&self, filter: Option<&MessageFilter>) -> Result<u64> {
        self.conn.read(|state| {
            let count = match filter {
                Some(filter) => state
                    .messages
                    .values()
                    .filter(|m| filter_matches(m, filter))
                    .count(),
                None => state.messages.len(),
            };
            Ok(count as u64)
        })
    }

    async fn clear(&self) -> Result<()> {
        self.conn.write(state::message_clear)
    }
}

// ============================================================================
// Outbox store
// ============================================================================

pub(crate) struct MemoryOutboxStore {
    conn: MemoryConn,
}

impl MemoryOutboxStore {
    pub fn new(conn: MemoryConn) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn add(&self, message: &Message, options: &PublishOptions) -> Result<OutboxEntry> {
        options.validate()?;
        let entry = OutboxEntry {
            id: Uuid::new_v4(),
            message: message.clone(),
            options: options.clone(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            processed_at: None,
            next_retry_at: None,
            last_error: None,
        };
        let inserted = entry.clone();
        self.conn
            .write(move |state| state::outbox_insert(state, inserted.clone()))?;
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        self.conn
            .read(|state| Ok(state.outbox.iter().find(|e| e.id == id).cloned()))
    }

    async fn get_pending(&self, query: &OutboxQuery) -> Result<Vec<OutboxEntry>> {
        let limit = bounded_limit(query.limit)?;
        let now = Utc::now();
        self.conn.read(|state| {
            Ok(
                state::outbox_visible_pending(state, query.destination.as_deref(), now)
                    .into_iter()
                    .take(limit)
                    .cloned()
                    .collect(),
            )
        })
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool> {
        self.conn
            .write(move |state| state::outbox_mark_processing(state, id))
    }

    async fn mark_processed(&self, id: Uuid) -> Result<bool> {
        let now = Utc::now();
        self.conn
            .write(move |state| state::outbox_mark_processed(state, id, now))
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let error = error.to_string();
        self.conn
            .write(move |state| state::outbox_mark_failed(state, id, error.clone()))
    }

    async fn update_retry_count(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.conn
            .write(move |state| state::outbox_update_retry(state, id, retry_count, next_retry_at))
    }

    async fn pending_count(&self) -> Result<u64> {
        self.conn.read(|state| {
            Ok(state
                .outbox
                .iter()
                .filter(|e| e.status == OutboxStatus::Pending)
                .count() as u64)
        })
    }

    async fn get_failed(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let limit = bounded_limit(limit)?;
        self.conn.read(|state| {
            let mut failed: Vec<OutboxEntry> = state
                .outbox
                .iter()
                .filter(|e| e.status == OutboxStatus::Failed)
                .cloned()
                .collect();
            failed.sort_by_key(|e| e.created_at);
            failed.truncate(limit);
            Ok(failed)
        })
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.conn
            .write(move |state| state::outbox_purge_processed(state, older_than))
    }
}

// ============================================================================
// Inbox store
// ============================================================================

pub(crate) struct MemoryInboxStore {
    conn: MemoryConn,
}

impl MemoryInboxStore {
    pub fn new(conn: MemoryConn) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl InboxStore for MemoryInboxStore {
    async fn add(&self, message: &Message, options: &ReceiveOptions) -> Result<Option<InboxEntry>> {
        let now = Utc::now();
        let entry = InboxEntry {
            id: message.id,
            message: message.clone(),
            options: options.clone(),
            status: InboxStatus::Pending,
            received_at: now,
            processed_at: None,
            error: None,
        };
        let require_idempotency = options.require_idempotency;
        self.conn.write_with(move |state| {
            if state::inbox_is_duplicate(state, entry.id, entry.options.dedup_window, now) {
                if require_idempotency {
                    return Ok((None, None));
                }
                return Err(HeraldError::Conflict(format!(
                    "message {} already recorded inside the dedup window",
                    entry.id
                )));
            }
            state::inbox_insert(state, entry.clone())?;
            let redo_entry = entry.clone();
            let op: RedoOp = Box::new(move |s| state::inbox_insert(s, redo_entry.clone()));
            Ok((Some(entry.clone()), Some(op)))
        })
    }

    async fn is_duplicate(&self, message_id: Uuid, window: Duration) -> Result<bool> {
        let now = Utc::now();
        self.conn
            .read(|state| Ok(state::inbox_is_duplicate(state, message_id, window, now)))
    }

    async fn get(&self, message_id: Uuid) -> Result<Option<InboxEntry>> {
        self.conn
            .read(|state| Ok(state.inbox.iter().find(|e| e.id == message_id).cloned()))
    }

    async fn mark_processing(&self, message_id: Uuid) -> Result<bool> {
        self.conn
            .write(move |state| state::inbox_mark_processing(state, message_id))
    }

    async fn mark_processed(&self, message_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        self.conn
            .write(move |state| state::inbox_mark_processed(state, message_id, now))
    }

    async fn mark_failed(&self, message_id: Uuid, error: &str) -> Result<bool> {
        let error = error.to_string();
        self.conn
            .write(move |state| state::inbox_mark_failed(state, message_id, error.clone()))
    }

    async fn release(&self, message_id: Uuid) -> Result<bool> {
        self.conn
            .write(move |state| state::inbox_release(state, message_id))
    }

    async fn get_pending(&self, query: &InboxQuery) -> Result<Vec<InboxEntry>> {
        let limit = bounded_limit(query.limit)?;
        self.conn.read(|state| {
            let mut pending: Vec<InboxEntry> = state
                .inbox
                .iter()
                .filter(|e| e.status == InboxStatus::Pending)
                .filter(|e| query.source.as_deref().map_or(true, |s| e.options.source == s))
                .filter(|e| {
                    query
                        .received_before
                        .map_or(true, |cutoff| e.received_at < cutoff)
                })
                .cloned()
                .collect();
            pending.sort_by_key(|e| e.received_at);
            pending.truncate(limit);
            Ok(pending)
        })
    }

    async fn get_unprocessed(&self, limit: usize) -> Result<Vec<InboxEntry>> {
        self.get_pending(&InboxQuery::with_limit(limit)).await
    }

    async fn unprocessed_count(&self) -> Result<u64> {
        self.conn.read(|state| {
            Ok(state
                .inbox
                .iter()
                .filter(|e| e.status == InboxStatus::Pending)
                .count() as u64)
        })
    }

    async fn cleanup_old_entries(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.conn
            .write(move |state| state::inbox_cleanup(state, older_than))
    }
}

// ============================================================================
// Queue store
// ============================================================================

pub(crate) struct MemoryQueueStore {
    conn: MemoryConn,
    defaults: QueueOptions,
}

impl MemoryQueueStore {
    pub fn new(conn: MemoryConn, defaults: QueueOptions) -> Self {
        Self { conn, defaults }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(
        &self,
        queue: &str,
        message: &Message,
        options: Option<EnqueueOptions>,
    ) -> Result<QueueEntry> {
        let options = options.unwrap_or_default();
        let now = Utc::now();
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            message: message.clone(),
            visible_at: options.delay.map(|d| now + state::to_chrono(d)),
            options,
            enqueued_at: now,
            dequeue_count: 0,
        };
        let queue = queue.to_string();
        let defaults = self.defaults.clone();
        let inserted = entry.clone();
        self.conn.write(move |state| {
            state::queue_enqueue(state, queue.clone(), inserted.clone(), defaults.clone())
        })?;
        Ok(entry)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<QueueEntry>> {
        let now = Utc::now();
        let queue = queue.to_string();
        let defaults = self.defaults.clone();
        self.conn.write_with(move |state| {
            let Some(id) = state::queue_select(state, &queue, now) else {
                return Ok((None, None));
            };
            let entry = state::queue_claim(state, &queue, id, now, defaults.clone())?;
            let redo_queue = queue.clone();
            let redo_defaults = defaults.clone();
            let op: RedoOp = Box::new(move |s| {
                state::queue_claim(s, &redo_queue, id, now, redo_defaults.clone()).map(|_| ())
            });
            Ok((Some(entry), Some(op)))
        })
    }

    async fn peek(&self, queue: &str, count: usize) -> Result<Vec<QueueEntry>> {
        let count = bounded_limit(count)?;
        let now = Utc::now();
        self.conn.read(|state| {
            Ok(state::queue_ready_entries(state, queue, now)
                .into_iter()
                .take(count)
                .cloned()
                .collect())
        })
    }

    async fn acknowledge(&self, queue: &str, entry_id: Uuid) -> Result<bool> {
        let queue = queue.to_string();
        self.conn
            .write(move |state| state::queue_ack(state, &queue, entry_id))
    }

    async fn reject(&self, queue: &str, entry_id: Uuid, requeue: bool) -> Result<bool> {
        let queue = queue.to_string();
        let defaults = self.defaults.clone();
        self.conn.write(move |state| {
            state::queue_reject(state, &queue, entry_id, requeue, defaults.clone())
        })
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let now = Utc::now();
        self.conn
            .read(|state| Ok(state::queue_live_entries(state, queue, now).len() as u64))
    }

    async fn create_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        let queue = queue.to_string();
        self.conn
            .write(move |state| state::queue_create(state, queue.clone(), options.clone()))
    }

    async fn delete_queue(&self, queue: &str) -> Result<bool> {
        let queue = queue.to_string();
        self.conn
            .write(move |state| state::queue_delete(state, &queue))
    }

    async fn get_queues(&self) -> Result<Vec<String>> {
        self.conn.read(|state| {
            let mut names: Vec<String> = state.queues.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        self.conn
            .read(|state| Ok(state.queues.contains_key(queue)))
    }
}
