//! Handler capability set and the typed registry.
//!
//! Handlers are registered explicitly at construction: a registry maps a
//! message type tag to the handler for it. Command and event handlers return
//! a [`ProcessingResult`]; query handlers return a typed result which the
//! registry erases to a JSON value for dispatch.

use crate::{HeraldError, Message, MessageKind, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Outcome of handling a command or event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// The effect happened; the entry can be settled.
    Completed,
    /// Nothing happened; redeliver later.
    Retry { reason: String },
    /// Nothing happened and redelivery is pointless.
    Failed { reason: String },
}

impl ProcessingResult {
    pub fn retry(reason: impl Into<String>) -> Self {
        ProcessingResult::Retry {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        ProcessingResult::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ProcessingResult::Completed)
    }
}

/// Kind-agnostic handler shape used by the processors.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<ProcessingResult>;
}

/// Consumes a command and reports the processing outcome.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Message) -> Result<ProcessingResult>;
}

/// Consumes an event and reports the processing outcome.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Message) -> Result<ProcessingResult>;
}

/// Consumes a query and returns a typed result.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    type Output: Send;

    async fn handle(&self, query: &Message) -> Result<Self::Output>;
}

struct CommandAdapter<H>(H);

#[async_trait]
impl<H: CommandHandler> MessageHandler for CommandAdapter<H> {
    async fn handle(&self, message: &Message) -> Result<ProcessingResult> {
        self.0.handle(message).await
    }
}

struct EventAdapter<H>(H);

#[async_trait]
impl<H: EventHandler> MessageHandler for EventAdapter<H> {
    async fn handle(&self, message: &Message) -> Result<ProcessingResult> {
        self.0.handle(message).await
    }
}

#[async_trait]
trait ErasedQueryHandler: Send + Sync {
    async fn handle_erased(&self, query: &Message) -> Result<serde_json::Value>;
}

struct QueryAdapter<H>(H);

#[async_trait]
impl<H> ErasedQueryHandler for QueryAdapter<H>
where
    H: QueryHandler,
    H::Output: Serialize,
{
    async fn handle_erased(&self, query: &Message) -> Result<serde_json::Value> {
        let output = self.0.handle(query).await?;
        Ok(serde_json::to_value(output)?)
    }
}

enum Registered {
    Processing {
        kind: MessageKind,
        handler: Arc<dyn MessageHandler>,
    },
    Query(Arc<dyn ErasedQueryHandler>),
}

/// Typed registry from message type tag to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Registered>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register_command<H>(&self, message_type: impl Into<String>, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.insert(
            message_type.into(),
            Registered::Processing {
                kind: MessageKind::Command,
                handler: Arc::new(CommandAdapter(handler)),
            },
        );
    }

    pub fn register_event<H>(&self, message_type: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.insert(
            message_type.into(),
            Registered::Processing {
                kind: MessageKind::Event,
                handler: Arc::new(EventAdapter(handler)),
            },
        );
    }

    pub fn register_query<H>(&self, message_type: impl Into<String>, handler: H)
    where
        H: QueryHandler + 'static,
        H::Output: Serialize,
    {
        self.insert(
            message_type.into(),
            Registered::Query(Arc::new(QueryAdapter(handler))),
        );
    }

    fn insert(&self, message_type: String, registered: Registered) {
        if self.handlers.insert(message_type.clone(), registered).is_some() {
            warn!(message_type = %message_type, "Handler replaced an existing registration");
        }
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a command or event to its registered handler.
    pub async fn dispatch(&self, message: &Message) -> Result<ProcessingResult> {
        let handler = {
            let entry = self.handlers.get(&message.message_type).ok_or_else(|| {
                HeraldError::NotFound(format!(
                    "no handler registered for '{}'",
                    message.message_type
                ))
            })?;
            match entry.value() {
                Registered::Processing { kind, handler } => {
                    if *kind != message.kind {
                        return Err(HeraldError::Validation(format!(
                            "handler for '{}' expects a {}, got a {}",
                            message.message_type, kind, message.kind
                        )));
                    }
                    Arc::clone(handler)
                }
                Registered::Query(_) => {
                    return Err(HeraldError::Validation(format!(
                        "'{}' is registered as a query; use dispatch_query",
                        message.message_type
                    )));
                }
            }
        };
        handler.handle(message).await
    }

    /// Dispatch a query and return its type-erased result.
    pub async fn dispatch_query(&self, query: &Message) -> Result<serde_json::Value> {
        let handler = {
            let entry = self.handlers.get(&query.message_type).ok_or_else(|| {
                HeraldError::NotFound(format!(
                    "no handler registered for '{}'",
                    query.message_type
                ))
            })?;
            match entry.value() {
                Registered::Query(handler) => Arc::clone(handler),
                Registered::Processing { .. } => {
                    return Err(HeraldError::Validation(format!(
                        "'{}' is not registered as a query",
                        query.message_type
                    )));
                }
            }
        };
        handler.handle_erased(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Message) -> Result<ProcessingResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessingResult::Completed)
        }
    }

    struct EchoQuery;

    #[async_trait]
    impl QueryHandler for EchoQuery {
        type Output = serde_json::Value;

        async fn handle(&self, query: &Message) -> Result<Self::Output> {
            Ok(query.payload.clone())
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_message_type() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        registry.register_event(
            "orders.placed",
            CountingHandler {
                calls: Arc::clone(&calls),
            },
        );

        let event = Message::event("orders.placed", serde_json::json!({}));
        let result = registry.dispatch(&event).await.unwrap();
        assert!(result.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_rejects_kind_mismatch() {
        let registry = HandlerRegistry::new();
        registry.register_event(
            "orders.placed",
            CountingHandler {
                calls: Arc::new(AtomicUsize::new(0)),
            },
        );

        let command = Message::command("orders.placed", serde_json::json!({}));
        assert!(matches!(
            registry.dispatch(&command).await,
            Err(HeraldError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_unregistered_is_not_found() {
        let registry = HandlerRegistry::new();
        let event = Message::event("unknown", serde_json::json!({}));
        assert!(matches!(
            registry.dispatch(&event).await,
            Err(HeraldError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn query_round_trips_payload() {
        let registry = HandlerRegistry::new();
        registry.register_query("orders.lookup", EchoQuery);

        let query = Message::query("orders.lookup", serde_json::json!({"id": 7}));
        let value = registry.dispatch_query(&query).await.unwrap();
        assert_eq!(value, serde_json::json!({"id": 7}));
    }
}
