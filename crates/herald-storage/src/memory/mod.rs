//! In-memory reference driver.
//!
//! One [`MemoryDatabase`] owns every table behind a single lock. Store
//! handles obtained from the database mutate it directly (auto-commit);
//! handles obtained from a [`MemoryUnitOfWork`] stage their effects on a
//! transaction-local working copy and a redo log, which commit replays
//! atomically against the live state.

mod database;
mod state;
mod stores;
mod unit_of_work;

pub use database::MemoryDatabase;
pub use unit_of_work::MemoryUnitOfWork;
