//! Table state and guarded transition functions.
//!
//! Every mutation is a plain function over `&mut DbState` taking fully
//! materialized values (identifiers and timestamps are generated by the
//! caller, never in here). Transactions log these same functions for replay
//! at commit, so a transition that conflicts with state committed after the
//! snapshot fails the whole commit instead of silently overwriting.

use chrono::{DateTime, Utc};
use herald_common::{
    dlq_name, truncate_error, HeraldError, InboxEntry, InboxStatus, Message, OutboxEntry,
    OutboxStatus, QueueEntry, QueueOptions, Result,
};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub message: Message,
    pub collection: String,
    #[allow(dead_code)]
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct QueueState {
    pub options: QueueOptions,
    pub entries: Vec<QueueEntry>,
}

impl QueueState {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            entries: Vec::new(),
        }
    }
}

/// Every table of the reference driver. Cheap enough to clone for
/// transaction snapshots and savepoints.
#[derive(Debug, Clone, Default)]
pub(crate) struct DbState {
    pub messages: HashMap<Uuid, StoredMessage>,
    pub outbox: Vec<OutboxEntry>,
    pub inbox: Vec<InboxEntry>,
    pub queues: HashMap<String, QueueState>,
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

pub(crate) fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.is_empty() {
        return Err(HeraldError::Validation(
            "queue name must not be empty".to_string(),
        ));
    }
    if !queue
        .chars()
        .all(|c| c.is_ascii_graphic())
    {
        return Err(HeraldError::Validation(format!(
            "queue name '{}' must be printable ASCII without whitespace",
            queue
        )));
    }
    Ok(())
}

// ============================================================================
// Message table
// ============================================================================

pub(crate) fn message_insert(state: &mut DbState, stored: StoredMessage) -> Result<()> {
    let id = stored.message.id;
    if state.messages.contains_key(&id) {
        return Err(HeraldError::Conflict(format!("message {} already stored", id)));
    }
    state.messages.insert(id, stored);
    Ok(())
}

pub(crate) fn message_update(state: &mut DbState, id: Uuid, message: Message) -> Result<bool> {
    match state.messages.get_mut(&id) {
        Some(stored) => {
            stored.message = message;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub(crate) fn message_delete(state: &mut DbState, id: Uuid) -> Result<bool> {
    Ok(state.messages.remove(&id).is_some())
}

pub(crate) fn message_clear(state: &mut DbState) -> Result<()> {
    state.messages.clear();
    Ok(())
}

// ============================================================================
// Outbox table
// ============================================================================

fn outbox_entry_mut<'a>(state: &'a mut DbState, id: Uuid) -> Result<&'a mut OutboxEntry> {
    state
        .outbox
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or_else(|| HeraldError::NotFound(format!("outbox entry {}", id)))
}

pub(crate) fn outbox_insert(state: &mut DbState, entry: OutboxEntry) -> Result<()> {
    if state.outbox.iter().any(|e| e.id == entry.id) {
        return Err(HeraldError::Conflict(format!(
            "outbox entry {} already exists",
            entry.id
        )));
    }
    state.outbox.push(entry);
    Ok(())
}

pub(crate) fn outbox_mark_processing(state: &mut DbState, id: Uuid) -> Result<bool> {
    let entry = outbox_entry_mut(state, id)?;
    match entry.status {
        OutboxStatus::Pending => {
            entry.status = OutboxStatus::Processing;
            Ok(true)
        }
        // Lost the race or already settled: not an error, just not ours.
        OutboxStatus::Processing | OutboxStatus::Processed | OutboxStatus::Failed => Ok(false),
    }
}

pub(crate) fn outbox_mark_processed(
    state: &mut DbState,
    id: Uuid,
    processed_at: DateTime<Utc>,
) -> Result<bool> {
    let entry = outbox_entry_mut(state, id)?;
    match entry.status {
        OutboxStatus::Processed => Ok(true),
        OutboxStatus::Failed => Err(HeraldError::fatal(
            "mark_processed",
            format!("outbox entry {}", id),
            "entry is terminally Failed",
        )),
        OutboxStatus::Pending | OutboxStatus::Processing => {
            entry.status = OutboxStatus::Processed;
            entry.processed_at = Some(processed_at);
            entry.next_retry_at = None;
            Ok(true)
        }
    }
}

pub(crate) fn outbox_mark_failed(state: &mut DbState, id: Uuid, error: String) -> Result<bool> {
    let entry = outbox_entry_mut(state, id)?;
    match entry.status {
        OutboxStatus::Failed => Ok(true),
        OutboxStatus::Processed => Err(HeraldError::fatal(
            "mark_failed",
            format!("outbox entry {}", id),
            "entry is terminally Processed",
        )),
        OutboxStatus::Pending | OutboxStatus::Processing => {
            entry.status = OutboxStatus::Failed;
            entry.last_error = Some(truncate_error(&error));
            entry.next_retry_at = None;
            Ok(true)
        }
    }
}

pub(crate) fn outbox_update_retry(
    state: &mut DbState,
    id: Uuid,
    retry_count: u32,
    next_retry_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    let entry = outbox_entry_mut(state, id)?;
    if entry.status.is_terminal() {
        return Err(HeraldError::fatal(
            "update_retry_count",
            format!("outbox entry {}", id),
            "entry is terminal",
        ));
    }
    if retry_count < entry.retry_count {
        return Err(HeraldError::Validation(format!(
            "retry count must be non-decreasing ({} < {})",
            retry_count, entry.retry_count
        )));
    }
    if retry_count > entry.options.max_retries {
        return Err(HeraldError::Validation(format!(
            "retry count {} exceeds max retries {}",
            retry_count, entry.options.max_retries
        )));
    }
    entry.retry_count = retry_count;
    entry.next_retry_at = next_retry_at;
    entry.status = OutboxStatus::Pending;
    Ok(true)
}

pub(crate) fn outbox_purge_processed(
    state: &mut DbState,
    older_than: DateTime<Utc>,
) -> Result<u64> {
    let before = state.outbox.len();
    state.outbox.retain(|e| {
        !(e.status == OutboxStatus::Processed
            && e.processed_at.map_or(false, |at| at < older_than))
    });
    Ok((before - state.outbox.len()) as u64)
}

/// Pending entries visible to a drain at `now`, oldest first.
pub(crate) fn outbox_visible_pending<'a>(
    state: &'a DbState,
    destination: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<&'a OutboxEntry> {
    let mut entries: Vec<&OutboxEntry> = state
        .outbox
        .iter()
        .filter(|e| e.status == OutboxStatus::Pending)
        .filter(|e| e.next_retry_at.map_or(true, |at| at <= now))
        .filter(|e| destination.map_or(true, |d| e.options.destination == d))
        .collect();
    entries.sort_by_key(|e| e.created_at);
    entries
}

// ============================================================================
// Inbox table
// ============================================================================

fn inbox_entry_mut<'a>(state: &'a mut DbState, id: Uuid) -> Result<&'a mut InboxEntry> {
    state
        .inbox
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or_else(|| HeraldError::NotFound(format!("inbox entry {}", id)))
}

/// A message identifier is a duplicate when any entry carries it and was
/// received inside the window ending at `now`.
pub(crate) fn inbox_is_duplicate(
    state: &DbState,
    id: Uuid,
    window: Duration,
    now: DateTime<Utc>,
) -> bool {
    state
        .inbox
        .iter()
        .any(|e| e.id == id && e.received_at + to_chrono(window) > now)
}

/// Insert a fresh ledger entry. An in-window duplicate is a Conflict; a
/// stale row with the same identifier (outside every live window) is
/// replaced so identifiers stay unique in storage.
pub(crate) fn inbox_insert(state: &mut DbState, entry: InboxEntry) -> Result<()> {
    if inbox_is_duplicate(state, entry.id, entry.options.dedup_window, entry.received_at) {
        return Err(HeraldError::Conflict(format!(
            "message {} already recorded inside the dedup window",
            entry.id
        )));
    }
    state.inbox.retain(|e| e.id != entry.id);
    state.inbox.push(entry);
    Ok(())
}

pub(crate) fn inbox_mark_processing(state: &mut DbState, id: Uuid) -> Result<bool> {
    let entry = inbox_entry_mut(state, id)?;
    match entry.status {
        InboxStatus::Pending => {
            entry.status = InboxStatus::Processing;
            Ok(true)
        }
        _ => Ok(false),
    }
}

pub(crate) fn inbox_mark_processed(
    state: &mut DbState,
    id: Uuid,
    processed_at: DateTime<Utc>,
) -> Result<bool> {
    let entry = inbox_entry_mut(state, id)?;
    match entry.status {
        InboxStatus::Processed => Ok(true),
        InboxStatus::Failed | InboxStatus::Duplicate => Err(HeraldError::fatal(
            "mark_processed",
            format!("inbox entry {}", id),
            "entry is terminal",
        )),
        InboxStatus::Pending | InboxStatus::Processing => {
            entry.status = InboxStatus::Processed;
            entry.processed_at = Some(processed_at);
            Ok(true)
        }
    }
}

pub(crate) fn inbox_mark_failed(state: &mut DbState, id: Uuid, error: String) -> Result<bool> {
    let entry = inbox_entry_mut(state, id)?;
    match entry.status {
        InboxStatus::Failed => Ok(true),
        InboxStatus::Processed | InboxStatus::Duplicate => Err(HeraldError::fatal(
            "mark_failed",
            format!("inbox entry {}", id),
            "entry is terminal",
        )),
        InboxStatus::Pending | InboxStatus::Processing => {
            entry.status = InboxStatus::Failed;
            entry.error = Some(truncate_error(&error));
            Ok(true)
        }
    }
}

pub(crate) fn inbox_release(state: &mut DbState, id: Uuid) -> Result<bool> {
    let entry = inbox_entry_mut(state, id)?;
    match entry.status {
        InboxStatus::Pending => Ok(true),
        InboxStatus::Processing => {
            entry.status = InboxStatus::Pending;
            Ok(true)
        }
        _ => Err(HeraldError::fatal(
            "release",
            format!("inbox entry {}", id),
            "entry is terminal",
        )),
    }
}

pub(crate) fn inbox_cleanup(state: &mut DbState, older_than: DateTime<Utc>) -> Result<u64> {
    let before = state.inbox.len();
    state
        .inbox
        .retain(|e| !(e.status.is_terminal() && e.received_at < older_than));
    Ok((before - state.inbox.len()) as u64)
}

// ============================================================================
// Queue tables
// ============================================================================

fn drop_expired(queue: &mut QueueState, now: DateTime<Utc>) {
    let default_ttl = queue.options.message_ttl;
    queue.entries.retain(|e| {
        let ttl = e.options.ttl.or(default_ttl);
        ttl.map_or(true, |ttl| e.enqueued_at + to_chrono(ttl) > now)
    });
}

/// Ready entries in service order: priority DESC (when enabled) then
/// enqueued_at ASC, insertion order breaking exact ties.
fn ready_positions(queue: &QueueState, now: DateTime<Utc>) -> Vec<usize> {
    let mut positions: Vec<usize> = queue
        .entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_visible(now))
        .map(|(i, _)| i)
        .collect();
    let priority_enabled = queue.options.priority_enabled;
    positions.sort_by(|&a, &b| {
        let (ea, eb) = (&queue.entries[a], &queue.entries[b]);
        let by_priority = if priority_enabled {
            eb.options.priority.cmp(&ea.options.priority)
        } else {
            std::cmp::Ordering::Equal
        };
        by_priority
            .then(ea.enqueued_at.cmp(&eb.enqueued_at))
            .then(a.cmp(&b))
    });
    positions
}

pub(crate) fn queue_create(state: &mut DbState, queue: String, options: QueueOptions) -> Result<()> {
    validate_queue_name(&queue)?;
    if state.queues.contains_key(&queue) {
        return Err(HeraldError::Conflict(format!("queue '{}' already exists", queue)));
    }
    state.queues.insert(queue, QueueState::new(options));
    Ok(())
}

pub(crate) fn queue_delete(state: &mut DbState, queue: &str) -> Result<bool> {
    Ok(state.queues.remove(queue).is_some())
}

pub(crate) fn queue_enqueue(
    state: &mut DbState,
    queue: String,
    entry: QueueEntry,
    defaults: QueueOptions,
) -> Result<()> {
    validate_queue_name(&queue)?;
    let qs = state
        .queues
        .entry(queue.clone())
        .or_insert_with(|| QueueState::new(defaults));
    drop_expired(qs, entry.enqueued_at);
    if let Some(max) = qs.options.max_size {
        if qs.entries.len() >= max {
            return Err(HeraldError::QueueFull(queue));
        }
    }
    qs.entries.push(entry);
    Ok(())
}

/// Claim a specific entry: bump its dequeue count and either hide it for
/// the visibility window or, past the queue's dequeue budget, move it to
/// the `.dlq` sibling. Returns the claimed snapshot.
pub(crate) fn queue_claim(
    state: &mut DbState,
    queue: &str,
    entry_id: Uuid,
    now: DateTime<Utc>,
    defaults: QueueOptions,
) -> Result<QueueEntry> {
    let entry = {
        let qs = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| HeraldError::NotFound(format!("queue '{}'", queue)))?;
        drop_expired(qs, now);
        let pos = qs
            .entries
            .iter()
            .position(|e| e.id == entry_id)
            .ok_or_else(|| {
                HeraldError::Conflict(format!("queue entry {} no longer present", entry_id))
            })?;
        if !qs.entries[pos].is_visible(now) {
            return Err(HeraldError::Conflict(format!(
                "queue entry {} claimed concurrently",
                entry_id
            )));
        }
        qs.entries[pos].dequeue_count += 1;
        let exceeded = qs
            .options
            .max_dequeue_count
            .map_or(false, |max| qs.entries[pos].dequeue_count > max);
        if !exceeded {
            let visibility = to_chrono(qs.options.visibility_timeout);
            qs.entries[pos].visible_at = Some(now + visibility);
            return Ok(qs.entries[pos].clone());
        }
        qs.entries.remove(pos)
    };

    // Dead-letter path: the entry leaves the source queue and lands,
    // immediately visible, on the sibling.
    let mut parked = entry.clone();
    parked.visible_at = None;
    let sibling = dlq_name(queue);
    let dq = state
        .queues
        .entry(sibling)
        .or_insert_with(|| QueueState::new(defaults));
    dq.entries.push(parked);
    Ok(entry)
}

/// Select the next eligible entry at `now` without mutating anything.
pub(crate) fn queue_select(state: &DbState, queue: &str, now: DateTime<Utc>) -> Option<Uuid> {
    let qs = state.queues.get(queue)?;
    let default_ttl = qs.options.message_ttl;
    let not_expired = |e: &QueueEntry| {
        let ttl = e.options.ttl.or(default_ttl);
        ttl.map_or(true, |ttl| e.enqueued_at + to_chrono(ttl) > now)
    };
    ready_positions(qs, now)
        .into_iter()
        .map(|i| &qs.entries[i])
        .find(|e| not_expired(e))
        .map(|e| e.id)
}

pub(crate) fn queue_ack(state: &mut DbState, queue: &str, entry_id: Uuid) -> Result<bool> {
    let qs = state
        .queues
        .get_mut(queue)
        .ok_or_else(|| HeraldError::NotFound(format!("queue '{}'", queue)))?;
    let before = qs.entries.len();
    qs.entries.retain(|e| e.id != entry_id);
    Ok(qs.entries.len() < before)
}

pub(crate) fn queue_reject(
    state: &mut DbState,
    queue: &str,
    entry_id: Uuid,
    requeue: bool,
    defaults: QueueOptions,
) -> Result<bool> {
    let dead = {
        let qs = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| HeraldError::NotFound(format!("queue '{}'", queue)))?;
        let Some(pos) = qs.entries.iter().position(|e| e.id == entry_id) else {
            return Ok(false);
        };
        if requeue {
            qs.entries[pos].visible_at = None;
            return Ok(true);
        }
        let exceeded = qs
            .options
            .max_dequeue_count
            .map_or(false, |max| qs.entries[pos].dequeue_count > max);
        let entry = qs.entries.remove(pos);
        if exceeded {
            Some(entry)
        } else {
            None
        }
    };

    if let Some(entry) = dead {
        let mut parked = entry;
        parked.visible_at = None;
        let sibling = dlq_name(queue);
        let dq = state
            .queues
            .entry(sibling)
            .or_insert_with(|| QueueState::new(defaults));
        dq.entries.push(parked);
    }
    Ok(true)
}

/// Entries currently held by the queue, TTL-expired ones treated as absent.
pub(crate) fn queue_live_entries<'a>(
    state: &'a DbState,
    queue: &str,
    now: DateTime<Utc>,
) -> Vec<&'a QueueEntry> {
    let Some(qs) = state.queues.get(queue) else {
        return Vec::new();
    };
    let default_ttl = qs.options.message_ttl;
    qs.entries
        .iter()
        .filter(|e| {
            let ttl = e.options.ttl.or(default_ttl);
            ttl.map_or(true, |ttl| e.enqueued_at + to_chrono(ttl) > now)
        })
        .collect()
}

/// Ready entries in service order, for peeking.
pub(crate) fn queue_ready_entries<'a>(
    state: &'a DbState,
    queue: &str,
    now: DateTime<Utc>,
) -> Vec<&'a QueueEntry> {
    let Some(qs) = state.queues.get(queue) else {
        return Vec::new();
    };
    let default_ttl = qs.options.message_ttl;
    ready_positions(qs, now)
        .into_iter()
        .map(|i| &qs.entries[i])
        .filter(|e| {
            let ttl = e.options.ttl.or(default_ttl);
            ttl.map_or(true, |ttl| e.enqueued_at + to_chrono(ttl) > now)
        })
        .collect()
}
