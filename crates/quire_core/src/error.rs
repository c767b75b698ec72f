use serde::Serialize;
use thiserror::Error;

use crate::crdt::DocTarget;

/// Unified error type for quire operations
#[derive(Debug, Error)]
pub enum QuireError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage temporarily unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,

    // Lookup errors
    #[error("Document not found: {0}")]
    DocumentNotFound(DocTarget),

    #[error("History entry {id} not found for {target}")]
    HistoryEntryNotFound { target: DocTarget, id: i64 },

    // CRDT errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Rendering errors
    #[error("Malformed change event: {0}")]
    MalformedEvent(String),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for quire operations
pub type Result<T> = std::result::Result<T, QuireError>;

impl QuireError {
    /// Whether the failure may clear up on its own, so retrying the same
    /// operation is worthwhile (busy or locked database, unavailable storage).
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            QuireError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            QuireError::StorageUnavailable(_) => true,
            _ => false,
        }
    }

    /// Whether a document or history entry lookup came up empty.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            QuireError::DocumentNotFound(_) | QuireError::HistoryEntryNotFound { .. }
        )
    }

    /// Convert to a serializable representation for HTTP bodies
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of QuireError for HTTP responses
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated document (if applicable)
    pub target: Option<DocTarget>,
}

impl From<&QuireError> for SerializableError {
    fn from(err: &QuireError) -> Self {
        let kind = match err {
            QuireError::Io(_) => "Io",
            #[cfg(feature = "sqlite")]
            QuireError::Database(_) => "Database",
            QuireError::StorageUnavailable(_) => "StorageUnavailable",
            QuireError::LockPoisoned => "LockPoisoned",
            QuireError::DocumentNotFound(_) => "DocumentNotFound",
            QuireError::HistoryEntryNotFound { .. } => "HistoryEntryNotFound",
            QuireError::Crdt(_) => "Crdt",
            QuireError::MalformedEvent(_) => "MalformedEvent",
            QuireError::ConfigParse(_) => "ConfigParse",
            QuireError::Json(_) => "Json",
        }
        .to_string();

        let target = match err {
            QuireError::DocumentNotFound(target) => Some(target.clone()),
            QuireError::HistoryEntryNotFound { target, .. } => Some(target.clone()),
            _ => None,
        };

        SerializableError {
            kind,
            message: err.to_string(),
            target,
        }
    }
}

impl From<QuireError> for SerializableError {
    fn from(err: QuireError) -> Self {
        SerializableError::from(&err)
    }
}
