//! Test utilities for quire_core
//!
//! Shared testing infrastructure: a client replica that produces update blobs
//! and a storage wrapper that fails on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use yrs::{Doc, GetString, Text, Transact};

use crate::crdt::{
    DeltaEntry, DeltaLog, DocSummary, DocTarget, DocumentStore, MemoryStorage, MergeFn,
    StorageResult, engine,
};
use crate::error::QuireError;

/// Name of the text root used by [`TestClient`].
pub const BODY: &str = "body";

/// A client-side replica that appends to a text root and hands out the
/// resulting update blobs.
pub struct TestClient {
    doc: Doc,
}

impl TestClient {
    /// Start from a stored state.
    pub fn from_state(state: &[u8]) -> Self {
        Self {
            doc: engine::doc_from_state(state).unwrap(),
        }
    }

    /// Append `text` and return the update describing the edit.
    pub fn append(&self, text: &str) -> Vec<u8> {
        let sv = engine::state_vector(&self.doc);
        let body = self.doc.get_or_insert_text(BODY);
        {
            let mut txn = self.doc.transact_mut();
            let len = body.len(&txn);
            body.insert(&mut txn, len, text);
        }
        engine::encode_diff(&self.doc, &sv)
    }
}

/// Text of the [`BODY`] root in an encoded state.
pub fn body_of(state: &[u8]) -> String {
    let doc = engine::doc_from_state(state).unwrap();
    let body = doc.get_or_insert_text(BODY);
    let txn = doc.transact();
    body.get_string(&txn)
}

/// Storage that fails the next `n` commits with a transient error.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStorage,
    failures_left: AtomicUsize,
    commits_attempted: AtomicUsize,
}

impl FlakyStore {
    pub fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(times),
            ..Default::default()
        })
    }

    pub fn commits_attempted(&self) -> usize {
        self.commits_attempted.load(Ordering::SeqCst)
    }
}

impl DeltaLog for FlakyStore {
    fn append_entry(
        &self,
        target: &DocTarget,
        author: Option<&str>,
        update: &[u8],
    ) -> StorageResult<i64> {
        self.inner.append_entry(target, author, update)
    }

    fn entries_until(
        &self,
        target: &DocTarget,
        until_id: i64,
        inclusive: bool,
    ) -> StorageResult<Vec<DeltaEntry>> {
        self.inner.entries_until(target, until_id, inclusive)
    }

    fn get_entry(&self, target: &DocTarget, id: i64) -> StorageResult<Option<DeltaEntry>> {
        self.inner.get_entry(target, id)
    }

    fn list_entries(
        &self,
        target: &DocTarget,
        offset: usize,
        limit: usize,
        recent_first: bool,
    ) -> StorageResult<Vec<DeltaEntry>> {
        self.inner.list_entries(target, offset, limit, recent_first)
    }

    fn count_entries(&self, target: &DocTarget) -> StorageResult<usize> {
        self.inner.count_entries(target)
    }

    fn latest_entry_id(&self, target: &DocTarget) -> StorageResult<Option<i64>> {
        self.inner.latest_entry_id(target)
    }
}

impl DocumentStore for FlakyStore {
    fn create_doc(&self, target_type: &str) -> StorageResult<DocTarget> {
        self.inner.create_doc(target_type)
    }

    fn save_doc(&self, target: &DocTarget, state: &[u8]) -> StorageResult<()> {
        self.inner.save_doc(target, state)
    }

    fn load_doc(&self, target: &DocTarget) -> StorageResult<Option<Vec<u8>>> {
        self.inner.load_doc(target)
    }

    fn list_summaries(&self, target_type: &str) -> StorageResult<Vec<DocSummary>> {
        self.inner.list_summaries(target_type)
    }

    fn commit_locked(
        &self,
        target: &DocTarget,
        author: Option<&str>,
        merge: &mut MergeFn<'_>,
    ) -> StorageResult<i64> {
        self.commits_attempted.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QuireError::StorageUnavailable("injected failure".into()));
        }
        self.inner.commit_locked(target, author, merge)
    }
}
