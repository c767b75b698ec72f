//! Shared types for CRDT persistence and history.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Document values copied out of the CRDT state on every commit, keyed by
/// field name, so listings can show them without decoding the document.
pub type DocFields = BTreeMap<String, Value>;

/// Identity of a persisted document: the kind of record it belongs to plus
/// that record's id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocTarget {
    /// Record kind, e.g. `"doc"`
    pub target_type: String,
    /// Record id within its kind
    pub target_id: i64,
}

impl DocTarget {
    /// Create a target from its parts.
    pub fn new(target_type: impl Into<String>, target_id: i64) -> Self {
        Self {
            target_type: target_type.into(),
            target_id,
        }
    }
}

impl fmt::Display for DocTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.target_type, self.target_id)
    }
}

/// One record of the append-only history log.
///
/// `update` is the net change written by a single flush, encoded as a yrs v1
/// update. Entries are immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Log-assigned id, strictly increasing
    pub id: i64,

    /// Document this entry belongs to
    pub target: DocTarget,

    /// Who made the change, if known
    pub author: Option<String>,

    /// When the entry was appended
    pub time: DateTime<Utc>,

    /// Encoded update blob
    pub update: Vec<u8>,
}

impl DeltaEntry {
    /// Metadata-only view of this entry.
    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            id: self.id,
            author: self.author.clone(),
            time: self.time,
            update_size: self.update.len(),
        }
    }
}

/// Entry metadata without the update payload, for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySummary {
    /// Entry id
    pub id: i64,
    /// Author, if known
    pub author: Option<String>,
    /// When the entry was appended
    pub time: DateTime<Utc>,
    /// Size of the encoded update in bytes
    pub update_size: usize,
}

/// Result of merging buffered updates into a stored document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedState {
    /// Full encoded state after the merge
    pub state: Vec<u8>,
    /// Everything the merge added, relative to the state it started from
    pub delta: Vec<u8>,
    /// Copied fields to store next to the state; replaces the previous set
    pub fields: DocFields,
}

/// A stored document as listings see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocSummary {
    pub target: DocTarget,
    pub fields: DocFields,
    pub updated_at: DateTime<Utc>,
}

/// Convert a millisecond Unix timestamp to a UTC datetime.
pub(crate) fn timestamp_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
