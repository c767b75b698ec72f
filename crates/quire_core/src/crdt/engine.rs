//! Thin boundary over the yrs document engine.
//!
//! Everything else in the crate treats update blobs as opaque bytes and goes
//! through these helpers to decode, apply and re-encode them.

use std::collections::BTreeMap;

use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, OffsetKind, Options, Out, ReadTxn, StateVector, Transact, Update};

use super::types::{DocFields, MergedState};
use crate::config::CopyField;
use crate::error::{QuireError, Result};

/// Create an empty document.
///
/// Text offsets are counted in UTF-16 code units, which is what browser clients
/// use and what the diff renderer expects in text deltas.
pub fn new_doc() -> Doc {
    Doc::with_options(Options {
        offset_kind: OffsetKind::Utf16,
        ..Options::default()
    })
}

/// Encoded state of a document with no content.
pub fn empty_state() -> Vec<u8> {
    encode_state(&new_doc())
}

/// Decode a v1 update blob.
pub fn decode_update(blob: &[u8]) -> Result<Update> {
    Update::decode_v1(blob).map_err(|e| QuireError::Crdt(format!("Failed to decode update: {}", e)))
}

/// Apply a single update blob to a document.
pub fn apply_update(doc: &Doc, blob: &[u8]) -> Result<()> {
    apply_updates(doc, [blob])
}

/// Apply several update blobs within one transaction, in order.
///
/// Every blob is decoded before the transaction starts, so a malformed blob
/// leaves the document untouched.
pub fn apply_updates<'a, I>(doc: &Doc, blobs: I) -> Result<()>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let updates = blobs
        .into_iter()
        .map(decode_update)
        .collect::<Result<Vec<_>>>()?;

    let mut txn = doc.transact_mut();
    for update in updates {
        txn.apply_update(update)
            .map_err(|e| QuireError::Crdt(format!("Failed to apply update: {}", e)))?;
    }
    Ok(())
}

/// Build a document from a full encoded state.
pub fn doc_from_state(state: &[u8]) -> Result<Doc> {
    let doc = new_doc();
    apply_update(&doc, state)?;
    Ok(doc)
}

/// Encode the full state of a document as a single update.
pub fn encode_state(doc: &Doc) -> Vec<u8> {
    encode_diff(doc, &StateVector::default())
}

/// Current state vector of a document.
pub fn state_vector(doc: &Doc) -> StateVector {
    doc.transact().state_vector()
}

/// Encode everything the document holds that `since` has not seen.
pub fn encode_diff(doc: &Doc, since: &StateVector) -> Vec<u8> {
    doc.transact().encode_state_as_update_v1(since)
}

/// Merge buffered updates into a stored state.
///
/// The returned delta is the diff between the merged document and the state
/// vector of `base`, i.e. the net change of this merge.
pub fn merge_into_state<B: AsRef<[u8]>>(base: &[u8], updates: &[B]) -> Result<MergedState> {
    merge_copying_fields(base, updates, &[])
}

/// [`merge_into_state`], also copying `copy` out of the merged document.
pub fn merge_copying_fields<B: AsRef<[u8]>>(
    base: &[u8],
    updates: &[B],
    copy: &[CopyField],
) -> Result<MergedState> {
    let doc = doc_from_state(base)?;
    let state_at_load = state_vector(&doc);
    apply_updates(&doc, updates.iter().map(AsRef::as_ref))?;

    Ok(MergedState {
        state: encode_state(&doc),
        delta: encode_diff(&doc, &state_at_load),
        fields: copy_fields(&doc, copy),
    })
}

/// Read each copied field from its root map; missing keys become `null`.
pub fn copy_fields(doc: &Doc, copy: &[CopyField]) -> DocFields {
    let mut maps: BTreeMap<&str, BTreeMap<String, Value>> = BTreeMap::new();
    copy.iter()
        .map(|field| {
            let map = maps
                .entry(field.map.as_str())
                .or_insert_with(|| map_snapshot(doc, &field.map));
            let value = map.get(&field.key).cloned().unwrap_or(Value::Null);
            (field.field.clone(), value)
        })
        .collect()
}

/// Plain (non-collaborative) values stored in a root map, as JSON.
pub fn map_snapshot(doc: &Doc, name: &str) -> BTreeMap<String, Value> {
    let map = doc.get_or_insert_map(name);
    let txn = doc.transact();
    map.iter(&txn)
        .map(|(key, value)| (key.to_string(), out_to_json(&value, &txn)))
        .collect()
}

/// Convert an engine value to JSON. Shared types are flattened to their string
/// form.
pub fn out_to_json<T: ReadTxn>(value: &Out, txn: &T) -> Value {
    match value {
        Out::Any(any) => any_to_json(any),
        other => Value::String(other.clone().to_string(txn)),
    }
}

/// Convert a primitive engine value to JSON.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(n) => Value::from(*n),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), any_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use yrs::{GetString, Text};

    /// Produce `count` independent single-insert updates from separate clients.
    fn concurrent_updates(base: &[u8], count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                let doc = doc_from_state(base).unwrap();
                let sv = state_vector(&doc);
                let text = doc.get_or_insert_text("body");
                {
                    let mut txn = doc.transact_mut();
                    text.insert(&mut txn, 0, &format!("<{}>", i));
                }
                encode_diff(&doc, &sv)
            })
            .collect()
    }

    fn body_text(state: &[u8]) -> String {
        let doc = doc_from_state(state).unwrap();
        let text = doc.get_or_insert_text("body");
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_empty_state_round_trip() {
        let doc = doc_from_state(&empty_state()).unwrap();
        assert_eq!(encode_state(&doc), empty_state());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = decode_update(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(QuireError::Crdt(_))));
    }

    #[test]
    fn test_malformed_blob_leaves_doc_untouched() {
        let base = empty_state();
        let good = concurrent_updates(&base, 1).remove(0);
        let doc = doc_from_state(&base).unwrap();

        let result = apply_updates(&doc, [good.as_slice(), &[0xff, 0xff, 0xff][..]]);
        assert!(result.is_err());
        assert_eq!(encode_state(&doc), encode_state(&doc_from_state(&base).unwrap()));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let base = empty_state();
        let updates = concurrent_updates(&base, 6);
        let expected = body_text(&merge_into_state(&base, &updates).unwrap().state);

        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let mut shuffled = updates.clone();
            shuffled.shuffle(&mut rng);
            let merged = merge_into_state(&base, &shuffled).unwrap();
            assert_eq!(body_text(&merged.state), expected);
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = empty_state();
        let updates = concurrent_updates(&base, 3);
        let once = merge_into_state(&base, &updates).unwrap();

        let mut doubled = updates.clone();
        doubled.extend(updates.iter().cloned());
        let twice = merge_into_state(&base, &doubled).unwrap();

        assert_eq!(body_text(&once.state), body_text(&twice.state));
    }

    #[test]
    fn test_merge_delta_applies_on_base() {
        let base = empty_state();
        let updates = concurrent_updates(&base, 4);
        let merged = merge_into_state(&base, &updates).unwrap();

        let doc = doc_from_state(&base).unwrap();
        apply_update(&doc, &merged.delta).unwrap();
        assert_eq!(body_text(&encode_state(&doc)), body_text(&merged.state));
    }

    #[test]
    fn test_map_snapshot() {
        let doc = new_doc();
        let map = doc.get_or_insert_map("fields");
        {
            let mut txn = doc.transact_mut();
            map.insert(&mut txn, "title", "Minutes");
            map.insert(&mut txn, "count", 3.0);
            map.insert(&mut txn, "done", false);
        }

        let snapshot = map_snapshot(&doc, "fields");
        assert_eq!(snapshot["title"], Value::String("Minutes".into()));
        assert_eq!(snapshot["count"], serde_json::json!(3.0));
        assert_eq!(snapshot["done"], Value::Bool(false));
    }

    #[test]
    fn test_merge_copies_fields() {
        let base = empty_state();
        let doc = doc_from_state(&base).unwrap();
        let sv = state_vector(&doc);
        let map = doc.get_or_insert_map("non_collab_fields");
        {
            let mut txn = doc.transact_mut();
            map.insert(&mut txn, "name", "Budget");
        }
        let update = encode_diff(&doc, &sv);

        let copy = [
            CopyField::new("name", "non_collab_fields", "name"),
            CopyField::new("score", "non_collab_fields", "score"),
        ];
        let merged = merge_copying_fields(&base, &[update.clone()], &copy).unwrap();
        assert_eq!(merged.fields["name"], Value::String("Budget".into()));
        assert_eq!(merged.fields["score"], Value::Null);

        let plain = merge_into_state(&base, &[update]).unwrap();
        assert!(plain.fields.is_empty());
        assert_eq!(plain.state, merged.state);
    }

    #[test]
    fn test_any_to_json_nested() {
        let any = Any::Array(vec![Any::from(1.5), Any::from("x"), Any::Null].into());
        assert_eq!(any_to_json(&any), serde_json::json!([1.5, "x", null]));
    }
}
