//! Bounded query types for the store contracts.
//!
//! Unbounded listings are forbidden: every query carries a limit and drivers
//! reject a limit of zero.

use chrono::{DateTime, Utc};
use herald_common::{HeraldError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default bound applied when callers do not pick one.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Ordering key for message queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKey {
    Timestamp,
    MessageType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Filter for `MessageStore::query` and `MessageStore::count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFilter {
    /// Restrict to one collection.
    pub collection: Option<String>,
    /// Inclusive lower bound on the message timestamp.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the message timestamp.
    pub to: Option<DateTime<Utc>>,
    /// Every pair must match the message metadata exactly.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Substring matched against the type tag and the encoded payload.
    pub text: Option<String>,
    pub order_by: OrderKey,
    pub direction: SortDirection,
    pub offset: usize,
    pub limit: usize,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            collection: None,
            from: None,
            to: None,
            metadata: HashMap::new(),
            text: None,
            order_by: OrderKey::Timestamp,
            direction: SortDirection::Ascending,
            offset: 0,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl MessageFilter {
    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn since(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn until(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn containing(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn order_by(mut self, key: OrderKey) -> Self {
        self.order_by = key;
        self
    }

    pub fn descending(mut self) -> Self {
        self.direction = SortDirection::Descending;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Query for pending outbox entries visible to a drain.
#[derive(Debug, Clone)]
pub struct OutboxQuery {
    /// Restrict to one destination.
    pub destination: Option<String>,
    pub limit: usize,
}

impl Default for OutboxQuery {
    fn default() -> Self {
        Self {
            destination: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl OutboxQuery {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            destination: None,
            limit,
        }
    }

    pub fn for_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Query for pending inbox entries.
#[derive(Debug, Clone)]
pub struct InboxQuery {
    /// Restrict to one source tag.
    pub source: Option<String>,
    /// Only entries received strictly before this instant.
    pub received_before: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for InboxQuery {
    fn default() -> Self {
        Self {
            source: None,
            received_before: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl InboxQuery {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            source: None,
            received_before: None,
            limit,
        }
    }

    pub fn received_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.received_before = Some(cutoff);
        self
    }
}

/// Reject a zero limit before it turns into an unbounded listing.
pub(crate) fn bounded_limit(limit: usize) -> Result<usize> {
    if limit == 0 {
        return Err(HeraldError::Validation(
            "listing limit must be greater than zero".to_string(),
        ));
    }
    Ok(limit)
}
