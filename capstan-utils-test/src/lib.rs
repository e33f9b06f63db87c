//! Self-contained test doubles for the capstan workspace.
//!
//! [`MemoryStore`] is a complete [`Store`](capstan_store_core::Store) over
//! in-memory state; [`serve_worker`] is a scripted in-process peer speaking
//! the serve protocol over any byte stream. Together they let the dispatch
//! core run end-to-end without SSH, a store daemon, or external tooling.

pub mod memory_store;
pub mod serve_worker;

pub use memory_store::MemoryStore;
pub use serve_worker::{spawn_worker, WorkerLog, WorkerScript};
