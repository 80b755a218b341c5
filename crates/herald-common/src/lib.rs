use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub mod backoff;
pub mod error;
pub mod handler;
pub mod logging;

pub use backoff::BackoffPolicy;
pub use error::{HeraldError, Result};
pub use handler::{
    CommandHandler, EventHandler, HandlerRegistry, MessageHandler, ProcessingResult, QueryHandler,
};

/// Maximum length of a persisted error string. Longer messages are truncated.
pub const MAX_ERROR_LEN: usize = 4096;

/// Suffix appended to a queue name to form its dead-letter sibling.
pub const DLQ_SUFFIX: &str = ".dlq";

/// Dead-letter sibling name for a queue.
pub fn dlq_name(queue: &str) -> String {
    format!("{}{}", queue, DLQ_SUFFIX)
}

/// Truncate an error message to the persisted limit.
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        error.to_string()
    } else {
        let mut end = MAX_ERROR_LEN;
        while !error.is_char_boundary(end) {
            end -= 1;
        }
        error[..end].to_string()
    }
}

// ============================================================================
// Core Message Types
// ============================================================================

/// Role a message plays in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Request to change state.
    Command,
    /// Request for data.
    Query,
    /// Fact notification.
    Event,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Query => write!(f, "query"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// The message envelope that flows through every store and engine.
///
/// Identity is immutable and stable across retries; metadata is additive.
/// The payload is self-describing: `message_type` is the type tag, the body
/// is an encoded JSON value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub causation_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn command(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(MessageKind::Command, message_type, payload)
    }

    pub fn query(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(MessageKind::Query, message_type, payload)
    }

    pub fn event(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(MessageKind::Event, message_type, payload)
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Add one metadata entry. Metadata is additive; existing keys are
    /// overwritten, identity fields never change.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Derive correlation and causation from the message that caused this one.
    pub fn caused_by(mut self, parent: &Message) -> Self {
        self.correlation_id = parent.correlation_id.or(Some(parent.id));
        self.causation_id = Some(parent.id);
        self
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// ============================================================================
// Outbox Types
// ============================================================================

/// Outbox entry status, stored as an integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Awaiting delivery (code: 0).
    Pending,
    /// Claimed by a drain (code: 1).
    Processing,
    /// Delivered; terminal (code: 2).
    Processed,
    /// Retries exhausted; terminal (code: 3).
    Failed,
}

impl OutboxStatus {
    pub fn code(&self) -> i32 {
        match self {
            OutboxStatus::Pending => 0,
            OutboxStatus::Processing => 1,
            OutboxStatus::Processed => 2,
            OutboxStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => OutboxStatus::Processing,
            2 => OutboxStatus::Processed,
            3 => OutboxStatus::Failed,
            _ => OutboxStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Processed | OutboxStatus::Failed)
    }
}

impl Default for OutboxStatus {
    fn default() -> Self {
        OutboxStatus::Pending
    }
}

/// Publishing options attached to each outbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    /// Destination name handed to the transport.
    pub destination: String,
    /// Drain priority; higher first where the driver supports it.
    pub priority: i32,
    /// Delivery attempts before the entry is marked Failed.
    pub max_retries: u32,
    /// Retry scheduling policy.
    pub backoff: BackoffPolicy,
}

impl PublishOptions {
    pub fn to_destination(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Synchronous validation, raised before anything is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.destination.is_empty() {
            return Err(HeraldError::Validation(
                "publish options require a destination".to_string(),
            ));
        }
        if self.destination.len() > 255 {
            return Err(HeraldError::Validation(format!(
                "destination of {} bytes exceeds the 255-byte limit",
                self.destination.len()
            )));
        }
        if self.max_retries > 1000 {
            return Err(HeraldError::Validation(format!(
                "max_retries {} is out of range (0..=1000)",
                self.max_retries
            )));
        }
        Ok(())
    }
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            destination: "default".to_string(),
            priority: 0,
            max_retries: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A durable send-buffer entry, co-committed with business data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Server-assigned entry identifier.
    pub id: Uuid,
    pub message: Message,
    pub options: PublishOptions,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Entries with a future value here are invisible to draining.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ============================================================================
// Inbox Types
// ============================================================================

/// Inbox entry status, stored as an integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboxStatus {
    /// Received, not yet handled (code: 0).
    Pending,
    /// Claimed by a processor (code: 1).
    Processing,
    /// Handled; terminal (code: 2).
    Processed,
    /// Handling gave up; terminal (code: 3).
    Failed,
    /// Recorded as a duplicate arrival; terminal from insertion (code: 4).
    Duplicate,
}

impl InboxStatus {
    pub fn code(&self) -> i32 {
        match self {
            InboxStatus::Pending => 0,
            InboxStatus::Processing => 1,
            InboxStatus::Processed => 2,
            InboxStatus::Failed => 3,
            InboxStatus::Duplicate => 4,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => InboxStatus::Processing,
            2 => InboxStatus::Processed,
            3 => InboxStatus::Failed,
            4 => InboxStatus::Duplicate,
            _ => InboxStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InboxStatus::Processed | InboxStatus::Failed | InboxStatus::Duplicate
        )
    }
}

impl Default for InboxStatus {
    fn default() -> Self {
        InboxStatus::Pending
    }
}

/// Options attached to an inbox entry at receive time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveOptions {
    /// Tag identifying where the message came from.
    pub source: String,
    /// When true, a duplicate add is reported with a sentinel instead of an
    /// error, signaling the caller to acknowledge upstream without
    /// reprocessing.
    pub require_idempotency: bool,
    /// Horizon within which a repeated message identifier counts as a
    /// duplicate.
    pub dedup_window: Duration,
}

impl ReceiveOptions {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_require_idempotency(mut self, require: bool) -> Self {
        self.require_idempotency = require;
        self
    }
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            source: "default".to_string(),
            require_idempotency: true,
            dedup_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A dedup-ledger entry. The identifier always equals the carried message
/// identifier; that equality is what makes deduplication work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    pub id: Uuid,
    pub message: Message,
    pub options: ReceiveOptions,
    pub status: InboxStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// ============================================================================
// Queue Types
// ============================================================================

/// Per-entry enqueue options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    /// Higher dequeues first when the queue has priority enabled.
    pub priority: i32,
    /// Initial invisibility window after enqueue.
    pub delay: Option<Duration>,
    /// Overrides the queue's message TTL for this entry.
    pub ttl: Option<Duration>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Per-queue configuration.
///
/// Ready entries are served strictly in (priority DESC, enqueued_at ASC)
/// order; there is no priority aging, so a saturated high priority can
/// starve lower ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    /// Enqueue fails with QueueFull once this many entries are held.
    pub max_size: Option<usize>,
    /// Entries older than this are silently discarded on next observation.
    pub message_ttl: Option<Duration>,
    /// Past this many dequeues an entry routes to the `.dlq` sibling.
    pub max_dequeue_count: Option<u32>,
    /// Window after a dequeue within which the entry is hidden.
    pub visibility_timeout: Duration,
    /// When false, entry priority is ignored and ordering is pure FIFO.
    pub priority_enabled: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_size: None,
            message_ttl: None,
            max_dequeue_count: None,
            visibility_timeout: Duration::from_secs(30),
            priority_enabled: true,
        }
    }
}

/// An entry held by a named queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: Uuid,
    pub message: Message,
    pub options: EnqueueOptions,
    pub enqueued_at: DateTime<Utc>,
    /// `None` means immediately visible; a future instant hides the entry.
    pub visible_at: Option<DateTime<Utc>>,
    pub dequeue_count: u32,
}

impl QueueEntry {
    /// Whether the entry is eligible for dequeue at `now`.
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at.map_or(true, |at| at <= now)
    }
}

// ============================================================================
// Isolation Levels
// ============================================================================

/// Transaction isolation requested from a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builders_set_kind_and_identity() {
        let cmd = Message::command("orders.place", serde_json::json!({"sku": "A-1"}));
        assert_eq!(cmd.kind, MessageKind::Command);
        assert_eq!(cmd.message_type, "orders.place");
        assert!(cmd.correlation_id.is_none());

        let evt = Message::event("orders.placed", serde_json::json!({})).caused_by(&cmd);
        assert_eq!(evt.correlation_id, Some(cmd.id));
        assert_eq!(evt.causation_id, Some(cmd.id));
    }

    #[test]
    fn payload_decodes_into_concrete_types() {
        #[derive(serde::Deserialize)]
        struct Placed {
            sku: String,
        }
        let msg = Message::command("orders.place", serde_json::json!({"sku": "A-1"}));
        let placed: Placed = msg.payload_as().unwrap();
        assert_eq!(placed.sku, "A-1");
        assert!(msg.payload_as::<Vec<u8>>().is_err());
    }

    #[test]
    fn metadata_is_additive() {
        let msg = Message::event("t", serde_json::json!({}))
            .with_metadata("tenant", serde_json::json!("acme"))
            .with_metadata("region", serde_json::json!("eu"));
        assert_eq!(msg.metadata.len(), 2);
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Processed,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::from_code(status.code()), status);
        }
        assert!(OutboxStatus::Processed.is_terminal());
        assert!(!OutboxStatus::Processing.is_terminal());
        assert!(InboxStatus::Duplicate.is_terminal());
    }

    #[test]
    fn publish_options_validation() {
        let mut options = PublishOptions::to_destination("svc-a");
        assert!(options.validate().is_ok());

        options.destination = String::new();
        assert!(matches!(
            options.validate(),
            Err(HeraldError::Validation(_))
        ));
    }

    #[test]
    fn dlq_name_uses_suffix() {
        assert_eq!(dlq_name("orders"), "orders.dlq");
    }

    #[test]
    fn error_truncation_bounds_length() {
        let long = "x".repeat(MAX_ERROR_LEN * 2);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn queue_entry_visibility() {
        let now = Utc::now();
        let mut entry = QueueEntry {
            id: Uuid::new_v4(),
            message: Message::event("t", serde_json::json!({})),
            options: EnqueueOptions::default(),
            enqueued_at: now,
            visible_at: None,
            dequeue_count: 0,
        };
        assert!(entry.is_visible(now));

        entry.visible_at = Some(now + chrono::Duration::seconds(30));
        assert!(!entry.is_visible(now));
        assert!(entry.is_visible(now + chrono::Duration::seconds(31)));
    }
}
