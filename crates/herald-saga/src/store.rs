//! Saga instance persistence.

use async_trait::async_trait;
use herald_common::{Message, MessageKind, Result};
use herald_storage::{MessageFilter, MessageStore, StoreMessageOptions};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

use crate::definition::SagaData;
use crate::instance::SagaInstance;

#[async_trait]
pub trait SagaStore<D: SagaData>: Send + Sync {
    async fn load(&self, saga_name: &str, correlation_id: Uuid)
        -> Result<Option<SagaInstance<D>>>;

    /// Upsert the instance under its correlation identifier.
    async fn save(&self, instance: &SagaInstance<D>) -> Result<()>;

    /// Non-terminal instances, bounded.
    async fn list_active(&self, saga_name: &str, limit: usize) -> Result<Vec<SagaInstance<D>>>;
}

const SAGA_COLLECTION: &str = "sagas";

fn saga_message_type(saga_name: &str) -> String {
    format!("saga.{}", saga_name)
}

/// Stores instances through any [`MessageStore`], one message per
/// correlation identifier. Handing this a store scoped to a unit of work
/// makes saga progression share the caller's transaction.
pub struct MessageSagaStore<D> {
    store: Arc<dyn MessageStore>,
    _marker: PhantomData<fn() -> D>,
}

impl<D> MessageSagaStore<D> {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }
}

fn instance_to_message<D: SagaData>(instance: &SagaInstance<D>) -> Result<Message> {
    let mut message = Message {
        id: instance.correlation_id,
        kind: MessageKind::Event,
        message_type: saga_message_type(&instance.saga_name),
        payload: serde_json::to_value(instance)?,
        timestamp: instance.updated_at,
        correlation_id: Some(instance.correlation_id),
        causation_id: None,
        metadata: HashMap::new(),
    };
    message.metadata.insert(
        "saga".to_string(),
        serde_json::Value::String(instance.saga_name.clone()),
    );
    message.metadata.insert(
        "active".to_string(),
        serde_json::Value::Bool(!instance.is_terminal()),
    );
    Ok(message)
}

#[async_trait]
impl<D: SagaData> SagaStore<D> for MessageSagaStore<D> {
    async fn load(
        &self,
        saga_name: &str,
        correlation_id: Uuid,
    ) -> Result<Option<SagaInstance<D>>> {
        let Some(message) = self.store.retrieve(correlation_id).await? else {
            return Ok(None);
        };
        if message.message_type != saga_message_type(saga_name) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(message.payload)?))
    }

    async fn save(&self, instance: &SagaInstance<D>) -> Result<()> {
        let message = instance_to_message(instance)?;
        if self.store.exists(instance.correlation_id).await? {
            self.store.update(instance.correlation_id, &message).await?;
        } else {
            self.store
                .store(
                    &message,
                    Some(StoreMessageOptions {
                        collection: SAGA_COLLECTION.to_string(),
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn list_active(&self, saga_name: &str, limit: usize) -> Result<Vec<SagaInstance<D>>> {
        let filter = MessageFilter::default()
            .in_collection(SAGA_COLLECTION)
            .with_metadata("saga", serde_json::Value::String(saga_name.to_string()))
            .with_metadata("active", serde_json::Value::Bool(true))
            .with_limit(limit);
        let messages = self.store.query(&filter).await?;
        let mut instances = Vec::with_capacity(messages.len());
        for message in messages {
            instances.push(serde_json::from_value(message.payload)?);
        }
        Ok(instances)
    }
}
