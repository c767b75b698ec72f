//! In-memory storage implementation for testing.
//!
//! This provides a simple in-memory implementation of [`DocumentStore`]
//! for use in unit tests and development.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::storage::{DeltaLog, DocumentStore, MergeFn, StorageResult};
use super::types::{DeltaEntry, DocFields, DocSummary, DocTarget};
use crate::error::QuireError;

/// In-memory document storage for testing.
///
/// All data lives behind a single `RwLock`, so holding the write lock is the
/// exclusive section [`DocumentStore::commit_locked`] needs. Data is lost when
/// dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct StoredDoc {
    state: Vec<u8>,
    fields: DocFields,
    updated_at: DateTime<Utc>,
}

impl StoredDoc {
    fn new(state: Vec<u8>) -> Self {
        Self {
            state,
            fields: DocFields::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Document state per target
    docs: HashMap<DocTarget, StoredDoc>,

    /// History log, in append order
    history: Vec<DeltaEntry>,

    /// Last history id handed out
    last_entry_id: i64,
}

impl Inner {
    fn append(&mut self, target: &DocTarget, author: Option<&str>, update: &[u8]) -> i64 {
        self.last_entry_id += 1;
        self.history.push(DeltaEntry {
            id: self.last_entry_id,
            target: target.clone(),
            author: author.map(str::to_string),
            time: Utc::now(),
            update: update.to_vec(),
        });
        self.last_entry_id
    }

    fn entries_for<'a>(&'a self, target: &'a DocTarget) -> impl Iterator<Item = &'a DeltaEntry> {
        self.history.iter().filter(move |e| &e.target == target)
    }
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| QuireError::LockPoisoned)
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| QuireError::LockPoisoned)
    }
}

impl DeltaLog for MemoryStorage {
    fn append_entry(
        &self,
        target: &DocTarget,
        author: Option<&str>,
        update: &[u8],
    ) -> StorageResult<i64> {
        Ok(self.write()?.append(target, author, update))
    }

    fn entries_until(
        &self,
        target: &DocTarget,
        until_id: i64,
        inclusive: bool,
    ) -> StorageResult<Vec<DeltaEntry>> {
        let inner = self.read()?;
        Ok(inner
            .entries_for(target)
            .filter(|e| e.id < until_id || (inclusive && e.id == until_id))
            .cloned()
            .collect())
    }

    fn get_entry(&self, target: &DocTarget, id: i64) -> StorageResult<Option<DeltaEntry>> {
        let inner = self.read()?;
        Ok(inner.entries_for(target).find(|e| e.id == id).cloned())
    }

    fn list_entries(
        &self,
        target: &DocTarget,
        offset: usize,
        limit: usize,
        recent_first: bool,
    ) -> StorageResult<Vec<DeltaEntry>> {
        let inner = self.read()?;
        let mut entries: Vec<DeltaEntry> = inner.entries_for(target).cloned().collect();
        if recent_first {
            entries.reverse();
        }
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    fn count_entries(&self, target: &DocTarget) -> StorageResult<usize> {
        Ok(self.read()?.entries_for(target).count())
    }

    fn latest_entry_id(&self, target: &DocTarget) -> StorageResult<Option<i64>> {
        Ok(self.read()?.entries_for(target).map(|e| e.id).max())
    }
}

impl DocumentStore for MemoryStorage {
    fn create_doc(&self, target_type: &str) -> StorageResult<DocTarget> {
        let mut inner = self.write()?;
        let next_id = inner
            .docs
            .keys()
            .filter(|t| t.target_type == target_type)
            .map(|t| t.target_id)
            .max()
            .unwrap_or(0)
            + 1;
        let target = DocTarget::new(target_type, next_id);
        inner
            .docs
            .insert(target.clone(), StoredDoc::new(super::engine::empty_state()));
        Ok(target)
    }

    fn save_doc(&self, target: &DocTarget, state: &[u8]) -> StorageResult<()> {
        let mut inner = self.write()?;
        match inner.docs.get_mut(target) {
            Some(doc) => {
                doc.state = state.to_vec();
                doc.updated_at = Utc::now();
            }
            None => {
                inner
                    .docs
                    .insert(target.clone(), StoredDoc::new(state.to_vec()));
            }
        }
        Ok(())
    }

    fn load_doc(&self, target: &DocTarget) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.read()?.docs.get(target).map(|doc| doc.state.clone()))
    }

    fn contains_doc(&self, target: &DocTarget) -> StorageResult<bool> {
        Ok(self.read()?.docs.contains_key(target))
    }

    fn list_summaries(&self, target_type: &str) -> StorageResult<Vec<DocSummary>> {
        let inner = self.read()?;
        let mut summaries: Vec<DocSummary> = inner
            .docs
            .iter()
            .filter(|(t, _)| t.target_type == target_type)
            .map(|(target, doc)| DocSummary {
                target: target.clone(),
                fields: doc.fields.clone(),
                updated_at: doc.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.target.cmp(&b.target));
        Ok(summaries)
    }

    fn commit_locked(
        &self,
        target: &DocTarget,
        author: Option<&str>,
        merge: &mut MergeFn<'_>,
    ) -> StorageResult<i64> {
        let mut inner = self.write()?;
        let base = inner
            .docs
            .get(target)
            .ok_or_else(|| QuireError::DocumentNotFound(target.clone()))?;

        let merged = merge(&base.state)?;
        inner.docs.insert(
            target.clone(),
            StoredDoc {
                state: merged.state,
                fields: merged.fields,
                updated_at: Utc::now(),
            },
        );
        Ok(inner.append(target, author, &merged.delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::MergedState;

    fn store_with_doc() -> (MemoryStorage, DocTarget) {
        let storage = MemoryStorage::new();
        let target = storage.create_doc("doc").unwrap();
        (storage, target)
    }

    #[test]
    fn test_create_doc_assigns_increasing_ids() {
        let storage = MemoryStorage::new();
        let first = storage.create_doc("doc").unwrap();
        let second = storage.create_doc("doc").unwrap();
        let other = storage.create_doc("note").unwrap();

        assert_eq!(first, DocTarget::new("doc", 1));
        assert_eq!(second, DocTarget::new("doc", 2));
        assert_eq!(other, DocTarget::new("note", 1));
        assert_eq!(storage.list_docs("doc").unwrap(), vec![first, second]);
    }

    #[test]
    fn test_save_and_load_doc() {
        let storage = MemoryStorage::new();
        let target = DocTarget::new("doc", 42);
        storage.save_doc(&target, b"state").unwrap();

        assert_eq!(storage.load_doc(&target).unwrap(), Some(b"state".to_vec()));
        assert!(storage.contains_doc(&target).unwrap());
    }

    #[test]
    fn test_load_nonexistent_doc() {
        let storage = MemoryStorage::new();
        assert!(storage.load_doc(&DocTarget::new("doc", 1)).unwrap().is_none());
    }

    #[test]
    fn test_entries_until_bounds() {
        let (storage, target) = store_with_doc();
        let a = storage.append_entry(&target, None, b"a").unwrap();
        let b = storage.append_entry(&target, Some("ada"), b"b").unwrap();
        let c = storage.append_entry(&target, None, b"c").unwrap();

        let exclusive = storage.entries_until(&target, b, false).unwrap();
        assert_eq!(exclusive.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a]);

        let inclusive = storage.entries_until(&target, b, true).unwrap();
        assert_eq!(inclusive.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(inclusive[1].author.as_deref(), Some("ada"));

        assert_eq!(storage.latest_entry_id(&target).unwrap(), Some(c));
    }

    #[test]
    fn test_entries_are_scoped_to_target() {
        let storage = MemoryStorage::new();
        let one = storage.create_doc("doc").unwrap();
        let two = storage.create_doc("doc").unwrap();
        storage.append_entry(&one, None, b"1").unwrap();
        let id = storage.append_entry(&two, None, b"2").unwrap();
        storage.append_entry(&one, None, b"3").unwrap();

        assert_eq!(storage.count_entries(&one).unwrap(), 2);
        assert_eq!(storage.count_entries(&two).unwrap(), 1);
        assert!(storage.get_entry(&one, id).unwrap().is_none());
        assert_eq!(storage.get_entry(&two, id).unwrap().unwrap().update, b"2");
    }

    #[test]
    fn test_list_entries_pages() {
        let (storage, target) = store_with_doc();
        let ids: Vec<i64> = (0..5)
            .map(|i| storage.append_entry(&target, None, &[i]).unwrap())
            .collect();

        let newest = storage.list_entries(&target, 0, 2, true).unwrap();
        assert_eq!(newest.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let oldest = storage.list_entries(&target, 1, 2, false).unwrap();
        assert_eq!(oldest.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ids[1], ids[2]]);
    }

    #[test]
    fn test_commit_locked_saves_and_appends() {
        let (storage, target) = store_with_doc();

        let id = storage
            .commit_locked(&target, Some("ada"), &mut |base| {
                let mut state = base.to_vec();
                state.push(9);
                Ok(MergedState {
                    state,
                    delta: vec![9],
                    ..Default::default()
                })
            })
            .unwrap();

        let entry = storage.get_entry(&target, id).unwrap().unwrap();
        assert_eq!(entry.update, vec![9]);
        assert_eq!(entry.author.as_deref(), Some("ada"));
        assert_eq!(storage.load_doc(&target).unwrap().unwrap().last(), Some(&9));
    }

    #[test]
    fn test_commit_locked_stores_copied_fields() {
        let (storage, target) = store_with_doc();
        let other = storage.create_doc("doc").unwrap();

        storage
            .commit_locked(&target, None, &mut |base| {
                Ok(MergedState {
                    state: base.to_vec(),
                    delta: vec![1],
                    fields: [("name".to_string(), serde_json::json!("Budget"))].into(),
                })
            })
            .unwrap();

        let summaries = storage.list_summaries("doc").unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].target, target);
        assert_eq!(summaries[0].fields["name"], serde_json::json!("Budget"));
        assert_eq!(summaries[1].target, other);
        assert!(summaries[1].fields.is_empty());

        // A plain save keeps the fields of the last commit
        storage.save_doc(&target, b"state").unwrap();
        assert_eq!(
            storage.list_summaries("doc").unwrap()[0].fields["name"],
            serde_json::json!("Budget")
        );
    }

    #[test]
    fn test_commit_locked_failure_changes_nothing() {
        let (storage, target) = store_with_doc();
        let before = storage.load_doc(&target).unwrap();

        let result = storage.commit_locked(&target, None, &mut |_| {
            Err(QuireError::StorageUnavailable("boom".into()))
        });

        assert!(result.is_err());
        assert_eq!(storage.load_doc(&target).unwrap(), before);
        assert_eq!(storage.count_entries(&target).unwrap(), 0);
    }

    #[test]
    fn test_commit_locked_unknown_doc() {
        let storage = MemoryStorage::new();
        let result = storage.commit_locked(&DocTarget::new("doc", 3), None, &mut |_| {
            unreachable!("merge must not run for a missing document")
        });
        assert!(matches!(result, Err(QuireError::DocumentNotFound(_))));
    }
}
