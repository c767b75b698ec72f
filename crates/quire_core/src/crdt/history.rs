//! History replay for documents.
//!
//! This module provides functionality for:
//! - Listing a document's history entries
//! - Reconstructing document state as of any entry ("inclusive" replay)
//! - Reconstructing the state right before an entry, so the entry can be
//!   applied with observers attached and its changes rendered
//!
//! # Example
//!
//! ```ignore
//! use quire_core::crdt::{MemoryStorage, Replayer};
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let replayer = Replayer::new(storage);
//!
//! let history = replayer.history(&target, Some(10))?;
//! let (doc, entry) = replayer.replay_until(&target, history[0].id)?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use yrs::Doc;

use super::engine;
use super::storage::{DocumentStore, StorageResult};
use super::types::{DeltaEntry, DocTarget, EntrySummary};
use crate::error::QuireError;

/// Maximum number of cached snapshots per document
const SNAPSHOT_CACHE_MAX_SIZE: usize = 10;

/// Snapshot interval - cache a snapshot every N replayed entries
const SNAPSHOT_INTERVAL: usize = 100;

/// Cached snapshot: the fold of every entry up to and including `entry_id`
#[derive(Clone)]
struct CachedSnapshot {
    entry_id: i64,
    state: Vec<u8>,
}

/// Reconstructs historical document states from the history log.
///
/// Includes an in-memory snapshot cache to speed up repeated history queries.
/// Because the log is append-only with increasing ids, a snapshot taken at an
/// entry stays valid forever.
pub struct Replayer {
    store: Arc<dyn DocumentStore>,
    /// Cache of snapshots: target -> snapshots ordered by entry id
    snapshot_cache: RwLock<HashMap<DocTarget, Vec<CachedSnapshot>>>,
}

impl Replayer {
    /// Create a replayer over the given storage backend.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            snapshot_cache: RwLock::new(HashMap::new()),
        }
    }

    /// History of a document, newest first.
    pub fn history(
        &self,
        target: &DocTarget,
        limit: Option<usize>,
    ) -> StorageResult<Vec<EntrySummary>> {
        self.ensure_doc(target)?;
        let entries =
            self.store
                .list_entries(target, 0, limit.unwrap_or(usize::MAX >> 1), true)?;
        Ok(entries.iter().map(DeltaEntry::summary).collect())
    }

    /// Fold the document's history into a fresh document.
    ///
    /// Every entry with an id below `until_id` is applied in id order; with
    /// `inclusive` the entry `until_id` is applied as well. Ids that don't
    /// exist are fine, the fold simply stops at the last entry in range.
    pub fn replay(&self, target: &DocTarget, until_id: i64, inclusive: bool) -> StorageResult<Doc> {
        self.ensure_doc(target)?;

        let last_included = if inclusive {
            until_id
        } else {
            until_id.saturating_sub(1)
        };
        let doc = engine::new_doc();

        let start_id = match self.find_nearest_snapshot(target, last_included) {
            Some(snapshot) => {
                engine::apply_update(&doc, &snapshot.state)?;
                snapshot.entry_id
            }
            None => i64::MIN,
        };

        let entries = self.store.entries_until(target, until_id, inclusive)?;
        let mut applied = 0usize;
        for entry in entries.iter().filter(|e| e.id > start_id) {
            engine::apply_update(&doc, &entry.update).map_err(|e| {
                QuireError::Crdt(format!("History entry {} of {}: {}", entry.id, target, e))
            })?;
            applied += 1;

            if applied % SNAPSHOT_INTERVAL == 0 {
                self.cache_snapshot(target, entry.id, engine::encode_state(&doc));
            }
        }

        log::debug!(
            "Replayed {} entries of {} (until {}, inclusive: {}, from snapshot: {})",
            applied,
            target,
            until_id,
            inclusive,
            start_id != i64::MIN
        );

        Ok(doc)
    }

    /// State immediately before `history_id`, together with that entry.
    ///
    /// Applying `entry.update` to the returned document yields the state as of
    /// the entry, which is how change events for a single entry are produced.
    pub fn replay_until(
        &self,
        target: &DocTarget,
        history_id: i64,
    ) -> StorageResult<(Doc, DeltaEntry)> {
        self.ensure_doc(target)?;
        let entry = self
            .store
            .get_entry(target, history_id)?
            .ok_or_else(|| QuireError::HistoryEntryNotFound {
                target: target.clone(),
                id: history_id,
            })?;
        let doc = self.replay(target, history_id, false)?;
        Ok((doc, entry))
    }

    /// Clear the snapshot cache for a document.
    pub fn clear_cache(&self, target: &DocTarget) {
        if let Ok(mut cache) = self.snapshot_cache.write() {
            cache.remove(target);
        }
    }

    fn ensure_doc(&self, target: &DocTarget) -> StorageResult<()> {
        if self.store.contains_doc(target)? {
            Ok(())
        } else {
            Err(QuireError::DocumentNotFound(target.clone()))
        }
    }

    /// Find the nearest cached snapshot at or before the given entry id.
    fn find_nearest_snapshot(&self, target: &DocTarget, entry_id: i64) -> Option<CachedSnapshot> {
        let cache = self.snapshot_cache.read().ok()?;
        cache
            .get(target)?
            .iter()
            .filter(|s| s.entry_id <= entry_id)
            .max_by_key(|s| s.entry_id)
            .cloned()
    }

    /// Cache a snapshot for faster future access.
    fn cache_snapshot(&self, target: &DocTarget, entry_id: i64, state: Vec<u8>) {
        let Ok(mut cache) = self.snapshot_cache.write() else {
            return;
        };
        let snapshots = cache.entry(target.clone()).or_default();

        if snapshots.iter().any(|s| s.entry_id == entry_id) {
            return;
        }

        snapshots.push(CachedSnapshot { entry_id, state });
        snapshots.sort_by_key(|s| s.entry_id);

        // Keep snapshots evenly distributed across the range
        if snapshots.len() > SNAPSHOT_CACHE_MAX_SIZE {
            let step = snapshots.len().div_ceil(SNAPSHOT_CACHE_MAX_SIZE);
            let kept: Vec<CachedSnapshot> = snapshots.iter().step_by(step).cloned().collect();
            *snapshots = kept;
        }
    }

    #[cfg(test)]
    fn cached_snapshot_ids(&self, target: &DocTarget) -> Vec<i64> {
        self.snapshot_cache
            .read()
            .unwrap()
            .get(target)
            .map(|s| s.iter().map(|s| s.entry_id).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::MemoryStorage;
    use yrs::{GetString, Text, Transact};

    /// Commit `edits` to a fresh document, one entry each, returning the store,
    /// target and the persisted state after every entry.
    fn build_history(edits: &[&str]) -> (Arc<MemoryStorage>, DocTarget, Vec<(i64, Vec<u8>)>) {
        let storage = Arc::new(MemoryStorage::new());
        let target = storage.create_doc("doc").unwrap();
        let mut states = Vec::new();

        for edit in edits {
            let id = storage
                .commit_locked(&target, Some("ada"), &mut |base| {
                    let doc = engine::doc_from_state(base)?;
                    let sv = engine::state_vector(&doc);
                    let text = doc.get_or_insert_text("body");
                    {
                        let mut txn = doc.transact_mut();
                        let len = text.len(&txn);
                        text.insert(&mut txn, len, edit);
                    }
                    let update = engine::encode_diff(&doc, &sv);
                    engine::merge_into_state(base, &[update])
                })
                .unwrap();
            states.push((id, storage.load_doc(&target).unwrap().unwrap()));
        }

        (storage, target, states)
    }

    fn body(doc: &Doc) -> String {
        let text = doc.get_or_insert_text("body");
        let txn = doc.transact();
        text.get_string(&txn)
    }

    fn state_body(state: &[u8]) -> String {
        body(&engine::doc_from_state(state).unwrap())
    }

    #[test]
    fn test_inclusive_replay_matches_persisted_state() {
        let (storage, target, states) = build_history(&["a", "b", "c", "d"]);
        let replayer = Replayer::new(storage);

        for (id, state) in &states {
            let doc = replayer.replay(&target, *id, true).unwrap();
            assert_eq!(body(&doc), state_body(state));
        }
    }

    #[test]
    fn test_exclusive_replay_stops_before_entry() {
        let (storage, target, states) = build_history(&["a", "b", "c"]);
        let replayer = Replayer::new(storage);

        let doc = replayer.replay(&target, states[2].0, false).unwrap();
        assert_eq!(body(&doc), "ab");

        let doc = replayer.replay(&target, states[0].0, false).unwrap();
        assert_eq!(body(&doc), "");
    }

    #[test]
    fn test_replay_until_plus_entry_equals_inclusive_replay() {
        let (storage, target, states) = build_history(&["one ", "two ", "three"]);
        let replayer = Replayer::new(storage);

        for (id, _) in &states {
            let (doc, entry) = replayer.replay_until(&target, *id).unwrap();
            assert_eq!(entry.id, *id);
            engine::apply_update(&doc, &entry.update).unwrap();

            let expected = replayer.replay(&target, *id, true).unwrap();
            assert_eq!(body(&doc), body(&expected));
        }
    }

    #[test]
    fn test_replay_until_unknown_entry() {
        let (storage, target, _) = build_history(&["a"]);
        let replayer = Replayer::new(storage);

        let result = replayer.replay_until(&target, 999);
        assert!(matches!(
            result,
            Err(QuireError::HistoryEntryNotFound { id: 999, .. })
        ));
    }

    #[test]
    fn test_replay_unknown_document() {
        let storage = Arc::new(MemoryStorage::new());
        let replayer = Replayer::new(storage);

        let result = replayer.replay(&DocTarget::new("doc", 1), 1, true);
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn test_replay_past_last_entry() {
        let (storage, target, states) = build_history(&["x", "y"]);
        let replayer = Replayer::new(storage);

        let doc = replayer.replay(&target, states[1].0 + 100, true).unwrap();
        assert_eq!(body(&doc), "xy");
    }

    #[test]
    fn test_replay_at_extreme_ids() {
        let (storage, target, _) = build_history(&["x", "y"]);
        let replayer = Replayer::new(storage);

        let doc = replayer.replay(&target, i64::MIN, false).unwrap();
        assert_eq!(body(&doc), "");

        let doc = replayer.replay(&target, i64::MAX, true).unwrap();
        assert_eq!(body(&doc), "xy");
    }

    #[test]
    fn test_history_newest_first() {
        let (storage, target, states) = build_history(&["a", "b", "c"]);
        let replayer = Replayer::new(storage);

        let history = replayer.history(&target, Some(2)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, states[2].0);
        assert_eq!(history[1].id, states[1].0);
        assert_eq!(history[0].author.as_deref(), Some("ada"));
    }

    #[test]
    fn test_snapshot_cache_gives_same_result() {
        let edits: Vec<String> = (0..(SNAPSHOT_INTERVAL * 2 + 5))
            .map(|i| format!("{} ", i % 10))
            .collect();
        let edit_refs: Vec<&str> = edits.iter().map(String::as_str).collect();
        let (storage, target, states) = build_history(&edit_refs);
        let replayer = Replayer::new(storage);

        let (last_id, last_state) = states.last().unwrap();
        let cold = replayer.replay(&target, *last_id, true).unwrap();
        assert_eq!(body(&cold), state_body(last_state));

        let cached = replayer.cached_snapshot_ids(&target);
        assert_eq!(
            cached,
            vec![states[SNAPSHOT_INTERVAL - 1].0, states[SNAPSHOT_INTERVAL * 2 - 1].0]
        );

        // Warm replays start from a snapshot and must agree with the log
        let warm = replayer.replay(&target, *last_id, true).unwrap();
        assert_eq!(body(&warm), body(&cold));

        let (mid_id, mid_state) = &states[SNAPSHOT_INTERVAL + 3];
        let mid = replayer.replay(&target, *mid_id, true).unwrap();
        assert_eq!(body(&mid), state_body(mid_state));

        replayer.clear_cache(&target);
        assert!(replayer.cached_snapshot_ids(&target).is_empty());
    }
}
