//! Unit of work and the transaction executor.
//!
//! A unit of work scopes one connection and one top-level transaction.
//! Operations on the store handles it exposes participate in that
//! transaction; at most one operation may be in flight per unit of work at a
//! time. If a transaction is still active when the unit of work is released,
//! the driver rolls it back.

use async_trait::async_trait;
use herald_common::{IsolationLevel, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::stores::{InboxStore, MessageStore, OutboxStore, QueueStore};

#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Open the transaction. A no-op when one is already active.
    async fn begin(&self, isolation: IsolationLevel) -> Result<()>;

    /// Terminal; releases savepoints. Either every staged effect is
    /// observable afterwards or none is.
    async fn commit(&self) -> Result<()>;

    /// Terminal; discards every staged effect.
    async fn rollback(&self) -> Result<()>;

    /// Record a named savepoint. Reusing a name redefines it.
    async fn savepoint(&self, name: &str) -> Result<()>;

    /// Discard effects staged after the named savepoint. The savepoint
    /// itself survives and can be rolled back to again.
    async fn rollback_to_savepoint(&self, name: &str) -> Result<()>;

    fn is_active(&self) -> bool;

    fn message_store(&self) -> Arc<dyn MessageStore>;
    fn outbox_store(&self) -> Arc<dyn OutboxStore>;
    fn inbox_store(&self) -> Arc<dyn InboxStore>;
    fn queue_store(&self) -> Arc<dyn QueueStore>;
}

#[async_trait]
pub trait UnitOfWorkFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn UnitOfWork>>;
}

/// Wraps an operation in begin / commit, rolling back and re-raising on any
/// error. Never swallows the original error; a rollback failure is logged
/// and the first error wins.
pub struct TransactionExecutor {
    factory: Arc<dyn UnitOfWorkFactory>,
    default_isolation: IsolationLevel,
}

impl TransactionExecutor {
    pub fn new(factory: Arc<dyn UnitOfWorkFactory>) -> Self {
        Self {
            factory,
            default_isolation: IsolationLevel::default(),
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }

    /// Run `operation` inside a fresh transaction. The name is only used
    /// for logging.
    pub async fn execute<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn UnitOfWork>) -> Fut,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let uow = self.factory.create().await?;
        uow.begin(self.default_isolation).await?;

        match f(Arc::clone(&uow)).await {
            Ok(value) => {
                uow.commit().await?;
                debug!(operation = %operation, "Transaction committed");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    error!(
                        operation = %operation,
                        error = %rollback_err,
                        "Rollback failed after operation error"
                    );
                }
                warn!(operation = %operation, error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }
}
