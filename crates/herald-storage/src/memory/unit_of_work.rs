//! Transactional unit of work over the in-memory state.
//!
//! `begin` snapshots the database into a working copy. Scoped store handles
//! mutate the working copy and log each mutation; `commit` replays the log
//! against a clone of the live state under the write lock and swaps it in
//! atomically. A replayed transition that conflicts with state committed
//! after the snapshot fails the whole commit, so the transaction is
//! all-or-nothing in both directions.

use async_trait::async_trait;
use herald_common::{HeraldError, IsolationLevel, QueueOptions, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

use crate::stores::{InboxStore, MessageStore, OutboxStore, QueueStore};
use crate::uow::UnitOfWork;

use super::state::DbState;
use super::stores::{
    MemoryConn, MemoryInboxStore, MemoryMessageStore, MemoryOutboxStore, MemoryQueueStore,
};

pub(crate) type RedoOp = Box<dyn Fn(&mut DbState) -> Result<()> + Send>;

pub(crate) struct Savepoint {
    name: String,
    redo_len: usize,
    state: DbState,
}

pub(crate) struct ActiveTx {
    pub isolation: IsolationLevel,
    pub working: DbState,
    pub redo: Vec<RedoOp>,
    pub savepoints: Vec<Savepoint>,
}

pub(crate) type TxCell = Mutex<Option<ActiveTx>>;

pub struct MemoryUnitOfWork {
    shared: Arc<RwLock<DbState>>,
    tx: Arc<TxCell>,
    queue_defaults: QueueOptions,
}

impl MemoryUnitOfWork {
    pub(crate) fn new(shared: Arc<RwLock<DbState>>, queue_defaults: QueueOptions) -> Self {
        Self {
            shared,
            tx: Arc::new(Mutex::new(None)),
            queue_defaults,
        }
    }

    /// Isolation requested at `begin`, when a transaction is active.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.tx.lock().as_ref().map(|tx| tx.isolation)
    }

    fn conn(&self) -> MemoryConn {
        MemoryConn::scoped(Arc::clone(&self.shared), Arc::clone(&self.tx))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn begin(&self, isolation: IsolationLevel) -> Result<()> {
        let mut guard = self.tx.lock();
        if guard.is_some() {
            return Ok(());
        }
        let snapshot = self.shared.read().clone();
        *guard = Some(ActiveTx {
            isolation,
            working: snapshot,
            redo: Vec::new(),
            savepoints: Vec::new(),
        });
        debug!(?isolation, "Transaction begun");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().take().ok_or_else(|| {
            HeraldError::Validation("commit requires an active transaction".to_string())
        })?;
        let mut shared = self.shared.write();
        let mut candidate = shared.clone();
        for op in &tx.redo {
            op(&mut candidate)?;
        }
        *shared = candidate;
        debug!(operations = tx.redo.len(), "Transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self.tx.lock().take().ok_or_else(|| {
            HeraldError::Validation("rollback requires an active transaction".to_string())
        })?;
        debug!(operations = tx.redo.len(), "Transaction rolled back");
        Ok(())
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        let mut guard = self.tx.lock();
        let tx = guard.as_mut().ok_or_else(|| {
            HeraldError::Validation("savepoint requires an active transaction".to_string())
        })?;
        let snapshot = tx.working.clone();
        let redo_len = tx.redo.len();
        match tx.savepoints.iter_mut().find(|sp| sp.name == name) {
            Some(existing) => {
                existing.redo_len = redo_len;
                existing.state = snapshot;
            }
            None => tx.savepoints.push(Savepoint {
                name: name.to_string(),
                redo_len,
                state: snapshot,
            }),
        }
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let mut guard = self.tx.lock();
        let tx = guard.as_mut().ok_or_else(|| {
            HeraldError::Validation(
                "rollback_to_savepoint requires an active transaction".to_string(),
            )
        })?;
        let pos = tx
            .savepoints
            .iter()
            .position(|sp| sp.name == name)
            .ok_or_else(|| HeraldError::NotFound(format!("savepoint '{}'", name)))?;
        tx.working = tx.savepoints[pos].state.clone();
        let redo_len = tx.savepoints[pos].redo_len;
        tx.redo.truncate(redo_len);
        tx.savepoints.truncate(pos + 1);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.tx.lock().is_some()
    }

    fn message_store(&self) -> Arc<dyn MessageStore> {
        Arc::new(MemoryMessageStore::new(self.conn()))
    }

    fn outbox_store(&self) -> Arc<dyn OutboxStore> {
        Arc::new(MemoryOutboxStore::new(self.conn()))
    }

    fn inbox_store(&self) -> Arc<dyn InboxStore> {
        Arc::new(MemoryInboxStore::new(self.conn()))
    }

    fn queue_store(&self) -> Arc<dyn QueueStore> {
        Arc::new(MemoryQueueStore::new(
            self.conn(),
            self.queue_defaults.clone(),
        ))
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        if let Some(mut guard) = self.tx.try_lock() {
            if guard.take().is_some() {
                debug!("Unit of work released with an active transaction; rolled back");
            }
        }
    }
}
