//! Storage contracts and the transactional unit of work.
//!
//! The four store traits are the only surface an engine sees; any driver
//! satisfying their invariants can back the system. The in-memory driver in
//! [`memory`] is the reference implementation and the one the test suites
//! run against.

pub mod memory;
pub mod query;
pub mod stores;
pub mod uow;

pub use memory::MemoryDatabase;
pub use query::{InboxQuery, MessageFilter, OrderKey, OutboxQuery, SortDirection};
pub use stores::{
    InboxStore, MessageStore, MessageStoreExt, OutboxStore, OutboxStoreExt, QueueStore,
    StoreMessageOptions,
};
pub use uow::{TransactionExecutor, UnitOfWork, UnitOfWorkFactory};
