//! Messages exchanged between editing sessions and the save worker.

use serde::{Deserialize, Serialize};

use crate::crdt::DocTarget;

/// Message consumed by the save worker.
///
/// Tagged with `type` when serialized, so sessions and the worker can live in
/// different processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// A connection produced an update that has to be persisted
    Updated {
        connection_id: String,
        document: DocTarget,
        author: Option<String>,
        update: Vec<u8>,
    },
    /// A connection is going away; persist whatever it has buffered
    Flush { connection_id: String },
}

impl WorkerMessage {
    /// Connection this message concerns.
    pub fn connection_id(&self) -> &str {
        match self {
            WorkerMessage::Updated { connection_id, .. } => connection_id,
            WorkerMessage::Flush { connection_id } => connection_id,
        }
    }
}

/// Outcome notifications published by the write coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushEvent {
    /// Buffer merged and written, with its history entry
    Persisted {
        connection_id: String,
        document: DocTarget,
        entry_id: i64,
        updates: usize,
        attempts: u32,
    },
    /// A transient failure; the flush is tried again after a delay
    Retrying {
        connection_id: String,
        document: DocTarget,
        attempt: u32,
        error: String,
    },
    /// Retries exhausted; the buffer was put back and will be flushed again
    Failed {
        connection_id: String,
        document: DocTarget,
        attempts: u32,
        error: String,
    },
    /// The buffer can never be written (e.g. the document is gone) and was dropped
    Discarded {
        connection_id: String,
        document: DocTarget,
        updates: usize,
        error: String,
    },
}
