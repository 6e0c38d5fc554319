//! Storage layer for the operation log.
//!
//! # Architecture
//!
//! - [`OpLogStore`] is the persistence contract: an append-only,
//!   sequence-numbered log of operations plus the persisted global vector
//!   clock and the latest snapshot.
//! - [`MemoryOpLogStore`] keeps everything in process memory.
//! - [`SqliteOpLogStore`] persists to a SQLite file; blocking calls run on
//!   the tokio blocking pool.
//! - [`VectorClockStore`] derives causal frontiers from whichever store it
//!   wraps.
//!
//! Sequence numbers are strictly increasing and never reused, even after
//! compaction deletes entries.

mod clock_store;
mod error;
mod memory;
mod sqlite;
mod store;

pub use clock_store::VectorClockStore;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryOpLogStore;
pub use sqlite::SqliteOpLogStore;
pub use store::OpLogStore;
