use async_trait::async_trait;
use herald_common::{QueueOptions, Result};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::stores::{InboxStore, MessageStore, OutboxStore, QueueStore};
use crate::uow::{UnitOfWork, UnitOfWorkFactory};

use super::state::DbState;
use super::stores::{
    MemoryConn, MemoryInboxStore, MemoryMessageStore, MemoryOutboxStore, MemoryQueueStore,
};
use super::unit_of_work::MemoryUnitOfWork;

/// The in-memory database backing the reference driver. Cloning shares the
/// underlying state.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<RwLock<DbState>>,
    queue_defaults: QueueOptions,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options applied to queues created lazily on first enqueue.
    pub fn with_queue_defaults(queue_defaults: QueueOptions) -> Self {
        Self {
            shared: Arc::new(RwLock::new(DbState::default())),
            queue_defaults,
        }
    }

    fn conn(&self) -> MemoryConn {
        MemoryConn::direct(Arc::clone(&self.shared))
    }

    /// Auto-commit handle: every operation commits on its own.
    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        Arc::new(MemoryMessageStore::new(self.conn()))
    }

    pub fn outbox_store(&self) -> Arc<dyn OutboxStore> {
        Arc::new(MemoryOutboxStore::new(self.conn()))
    }

    pub fn inbox_store(&self) -> Arc<dyn InboxStore> {
        Arc::new(MemoryInboxStore::new(self.conn()))
    }

    pub fn queue_store(&self) -> Arc<dyn QueueStore> {
        Arc::new(MemoryQueueStore::new(
            self.conn(),
            self.queue_defaults.clone(),
        ))
    }

    /// A fresh unit of work over this database's state.
    pub fn unit_of_work(&self) -> MemoryUnitOfWork {
        MemoryUnitOfWork::new(Arc::clone(&self.shared), self.queue_defaults.clone())
    }
}

#[async_trait]
impl UnitOfWorkFactory for MemoryDatabase {
    async fn create(&self) -> Result<Arc<dyn UnitOfWork>> {
        Ok(Arc::new(self.unit_of_work()))
    }
}
