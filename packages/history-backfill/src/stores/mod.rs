//! Storage implementations for records, cursors and dead letters.

pub mod json;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use json::JsonFileCursorStore;
pub use memory::{MemoryCursorStore, MemoryRecordStore};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
