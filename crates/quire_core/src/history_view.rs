//! History listings and single-entry views with rendered diffs.
//!
//! Both views replay the document to the state right before the entries being
//! shown, then apply each entry's update while recording the change events on
//! every rich-text field. The recorded events drive a [`DiffRenderer`] per
//! field, so each entry is shown as a diff against the state it was applied to.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use yrs::types::xml::XmlFragmentRef;
use yrs::{Doc, Transact};

use crate::crdt::{DocTarget, DocumentStore, EntrySummary, Replayer, StorageResult, engine};
use crate::error::QuireError;
use crate::render::{ChangeRecorder, DiffRenderer, fragment_to_source};

/// Default root map holding plain (non-collaborative) fields.
pub const DEFAULT_MAP_NAME: &str = "non_collab_fields";

/// A rich-text root of the document, shown as its own diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RichTextField {
    /// Root name in the document
    pub key: String,
    /// Human readable name
    pub label: String,
}

impl RichTextField {
    /// Create a field description.
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
        }
    }

    /// The `description` and `contents` fields.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("description", "Description"),
            Self::new("contents", "Contents"),
        ]
    }
}

/// Diff markup of one field for one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    /// Root name
    pub key: String,
    /// Human readable name
    pub label: String,
    /// XHTML with change classes
    pub diff: String,
}

/// One row of a history listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryListItem {
    /// Entry metadata
    pub entry: EntrySummary,
    /// One diff per rich-text field
    pub fields: Vec<FieldDiff>,
}

/// A page of history, newest entry first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage {
    /// Rows of this page
    pub items: Vec<HistoryListItem>,
    /// 1-based page number actually shown
    pub page: usize,
    /// Number of pages, at least 1
    pub num_pages: usize,
    /// Number of entries across all pages
    pub total: usize,
}

/// Before, after and diff markup of one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldView {
    /// Root name
    pub key: String,
    /// Human readable name
    pub label: String,
    /// Markup before the entry
    pub before: String,
    /// Markup after the entry
    pub after: String,
    /// Markup of the change
    pub diff: String,
}

/// A plain map value changed by an entry. `None` means absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapChange {
    /// Map key
    pub key: String,
    /// Value before the entry
    pub before: Option<Value>,
    /// Value after the entry
    pub after: Option<Value>,
}

/// Detail view of a single history entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryView {
    /// Entry metadata
    pub entry: EntrySummary,
    /// One view per rich-text field
    pub fields: Vec<FieldView>,
    /// Plain map keys changed by the entry
    pub map_changes: Vec<MapChange>,
}

/// Builds history views for documents in a store.
pub struct HistoryViewer {
    store: Arc<dyn DocumentStore>,
    replayer: Replayer,
    fields: Vec<RichTextField>,
    map_name: Option<String>,
}

impl HistoryViewer {
    /// Create a viewer showing `fields`, and changes to the root map
    /// `map_name` in entry views.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        fields: Vec<RichTextField>,
        map_name: Option<String>,
    ) -> Self {
        Self {
            replayer: Replayer::new(store.clone()),
            store,
            fields,
            map_name,
        }
    }

    /// Viewer with the default fields and map.
    pub fn with_defaults(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(
            store,
            RichTextField::defaults(),
            Some(DEFAULT_MAP_NAME.to_string()),
        )
    }

    /// Fields shown by this viewer.
    pub fn fields(&self) -> &[RichTextField] {
        &self.fields
    }

    /// Underlying replayer.
    pub fn replayer(&self) -> &Replayer {
        &self.replayer
    }

    /// One page of a document's history with a diff per entry and field.
    ///
    /// Pages are 1-based. Out-of-range page numbers are clamped to the first
    /// or last page.
    pub fn page(&self, target: &DocTarget, page: usize, per_page: usize) -> StorageResult<HistoryPage> {
        if !self.store.contains_doc(target)? {
            return Err(QuireError::DocumentNotFound(target.clone()));
        }

        let per_page = per_page.max(1);
        let total = self.store.count_entries(target)?;
        let num_pages = total.div_ceil(per_page).max(1);
        let page = page.clamp(1, num_pages);

        let entries = self
            .store
            .list_entries(target, (page - 1) * per_page, per_page, true)?;
        let Some(oldest) = entries.last() else {
            return Ok(HistoryPage {
                items: Vec::new(),
                page,
                num_pages,
                total,
            });
        };

        let doc = self.replayer.replay(target, oldest.id, false)?;
        let fragments = self.fragments(&doc);
        let recorders: Vec<ChangeRecorder> =
            fragments.iter().map(ChangeRecorder::observe).collect();

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries.iter().rev() {
            let mut renderers = render_all(&doc, &fragments);
            apply_entry(&doc, entry.id, &entry.update)?;

            let fields = self
                .fields
                .iter()
                .zip(renderers.iter_mut().zip(&recorders))
                .map(|(field, (renderer, recorder))| {
                    replay_events(renderer, recorder, entry.id);
                    FieldDiff {
                        key: field.key.clone(),
                        label: field.label.clone(),
                        diff: renderer.to_xhtml(),
                    }
                })
                .collect();

            items.push(HistoryListItem {
                entry: entry.summary(),
                fields,
            });
        }
        items.reverse();

        log::debug!(
            "Rendered history page {}/{} of {} ({} entries)",
            page,
            num_pages,
            target,
            items.len()
        );

        Ok(HistoryPage {
            items,
            page,
            num_pages,
            total,
        })
    }

    /// Before/after/diff view of a single entry.
    pub fn entry(&self, target: &DocTarget, history_id: i64) -> StorageResult<EntryView> {
        let (doc, entry) = self.replayer.replay_until(target, history_id)?;
        let fragments = self.fragments(&doc);

        let map_before = self
            .map_name
            .as_deref()
            .map(|name| engine::map_snapshot(&doc, name))
            .unwrap_or_default();
        let mut diffs = render_all(&doc, &fragments);
        let before: Vec<String> = diffs.iter().map(DiffRenderer::to_xhtml).collect();
        let recorders: Vec<ChangeRecorder> =
            fragments.iter().map(ChangeRecorder::observe).collect();

        apply_entry(&doc, entry.id, &entry.update)?;

        let after: Vec<String> = render_all(&doc, &fragments)
            .iter()
            .map(DiffRenderer::to_xhtml)
            .collect();
        for (renderer, recorder) in diffs.iter_mut().zip(&recorders) {
            replay_events(renderer, recorder, entry.id);
        }

        let fields = self
            .fields
            .iter()
            .zip(before)
            .zip(after)
            .zip(&diffs)
            .map(|(((field, before), after), diff)| FieldView {
                key: field.key.clone(),
                label: field.label.clone(),
                before,
                after,
                diff: diff.to_xhtml(),
            })
            .collect();

        let map_after = self
            .map_name
            .as_deref()
            .map(|name| engine::map_snapshot(&doc, name))
            .unwrap_or_default();
        let keys: BTreeSet<&String> = map_before.keys().chain(map_after.keys()).collect();
        let map_changes = keys
            .into_iter()
            .filter(|key| map_before.get(*key) != map_after.get(*key))
            .map(|key| MapChange {
                key: key.clone(),
                before: map_before.get(key).cloned(),
                after: map_after.get(key).cloned(),
            })
            .collect();

        Ok(EntryView {
            entry: entry.summary(),
            fields,
            map_changes,
        })
    }

    fn fragments(&self, doc: &Doc) -> Vec<XmlFragmentRef> {
        self.fields
            .iter()
            .map(|field| doc.get_or_insert_xml_fragment(field.key.as_str()))
            .collect()
    }
}

fn render_all(doc: &Doc, fragments: &[XmlFragmentRef]) -> Vec<DiffRenderer> {
    let txn = doc.transact();
    fragments
        .iter()
        .map(|fragment| DiffRenderer::new(&fragment_to_source(fragment, &txn)))
        .collect()
}

fn apply_entry(doc: &Doc, id: i64, update: &[u8]) -> StorageResult<()> {
    engine::apply_update(doc, update)
        .map_err(|e| QuireError::Crdt(format!("History entry {}: {}", id, e)))
}

fn replay_events(renderer: &mut DiffRenderer, recorder: &ChangeRecorder, entry_id: i64) {
    for event in recorder.take() {
        if let Err(e) = renderer.apply(&event) {
            log::warn!("Skipping change event of history entry {}: {}", entry_id, e);
        }
    }
}
