//! Storage abstraction for CRDT persistence.
//!
//! This module defines the [`DeltaLog`] and [`DocumentStore`] traits which
//! abstract over different storage backends (SQLite, in-memory) for persisting
//! documents and their history.

use super::types::{DeltaEntry, DocSummary, DocTarget, MergedState};
use crate::error::QuireError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, QuireError>;

/// Callback handed to [`DocumentStore::commit_locked`]: receives the stored
/// state and returns the state to persist plus the history delta.
pub type MergeFn<'a> = dyn FnMut(&[u8]) -> StorageResult<MergedState> + 'a;

/// Append-only history of update blobs, keyed by document.
///
/// Entry ids are assigned by the log and increase strictly. Entries are never
/// rewritten, reordered or deleted.
pub trait DeltaLog: Send + Sync {
    /// Append an entry and return its id.
    fn append_entry(
        &self,
        target: &DocTarget,
        author: Option<&str>,
        update: &[u8],
    ) -> StorageResult<i64>;

    /// Entries of `target` up to `until_id` in ascending id order.
    ///
    /// With `inclusive` the entry `until_id` itself is part of the result.
    fn entries_until(
        &self,
        target: &DocTarget,
        until_id: i64,
        inclusive: bool,
    ) -> StorageResult<Vec<DeltaEntry>>;

    /// A single entry of `target`.
    fn get_entry(&self, target: &DocTarget, id: i64) -> StorageResult<Option<DeltaEntry>>;

    /// A window of entries, newest first when `recent_first` is set.
    fn list_entries(
        &self,
        target: &DocTarget,
        offset: usize,
        limit: usize,
        recent_first: bool,
    ) -> StorageResult<Vec<DeltaEntry>>;

    /// Number of entries recorded for `target`.
    fn count_entries(&self, target: &DocTarget) -> StorageResult<usize>;

    /// Id of the newest entry of `target`, if any.
    fn latest_entry_id(&self, target: &DocTarget) -> StorageResult<Option<i64>>;
}

/// Trait for document storage backends.
///
/// Implementations of this trait handle persisting document state alongside
/// its [`DeltaLog`].
///
/// # Storage Model
///
/// The storage maintains two types of data:
/// 1. **Document state**: full encoded state of each document, plus the
///    fields copied out of it at the last commit
/// 2. **History**: one [`DeltaEntry`] per persisted change
///
/// [`commit_locked`](DocumentStore::commit_locked) is the only operation that
/// changes both at once, and it does so atomically.
pub trait DocumentStore: DeltaLog {
    /// Create a new, empty document of `target_type` with the next free id.
    fn create_doc(&self, target_type: &str) -> StorageResult<DocTarget>;

    /// Save the full document state, creating the document if needed.
    ///
    /// No history entry is written.
    fn save_doc(&self, target: &DocTarget, state: &[u8]) -> StorageResult<()>;

    /// Load the full document state.
    ///
    /// Returns `None` if the document doesn't exist.
    fn load_doc(&self, target: &DocTarget) -> StorageResult<Option<Vec<u8>>>;

    /// Check if a document exists.
    fn contains_doc(&self, target: &DocTarget) -> StorageResult<bool> {
        Ok(self.load_doc(target)?.is_some())
    }

    /// List all documents of `target_type`, ordered by id.
    fn list_docs(&self, target_type: &str) -> StorageResult<Vec<DocTarget>> {
        Ok(self
            .list_summaries(target_type)?
            .into_iter()
            .map(|summary| summary.target)
            .collect())
    }

    /// List all documents of `target_type` with their copied fields, ordered
    /// by id.
    fn list_summaries(&self, target_type: &str) -> StorageResult<Vec<DocSummary>>;

    /// Merge into a document while holding its exclusive section.
    ///
    /// The stored state is loaded and handed to `merge`; the returned state is
    /// saved together with its copied fields, and its delta appended to the
    /// history, attributed to `author`. Either all of this happens or none of
    /// it. Concurrent callers for the same document are serialized.
    ///
    /// Fails with [`QuireError::DocumentNotFound`] if the document doesn't
    /// exist. Returns the id of the new history entry.
    fn commit_locked(
        &self,
        target: &DocTarget,
        author: Option<&str>,
        merge: &mut MergeFn<'_>,
    ) -> StorageResult<i64>;
}
