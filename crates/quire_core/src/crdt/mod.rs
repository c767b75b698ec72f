#![doc = include_str!(concat!(env!("OUT_DIR"), "/crdt_README.md"))]

pub mod engine;
mod history;
mod memory_storage;
#[cfg(feature = "sqlite")]
mod sqlite_storage;
mod storage;
mod types;

pub use history::Replayer;
pub use memory_storage::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
pub use storage::{DeltaLog, DocumentStore, MergeFn, StorageResult};
pub use types::{DeltaEntry, DocFields, DocSummary, DocTarget, EntrySummary, MergedState};
