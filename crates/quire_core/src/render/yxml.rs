//! Adapter between yrs XML fragments and the renderer's owned types.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use yrs::types::text::YChange;
use yrs::types::xml::{XmlFragment, XmlFragmentRef, XmlOut, XmlTextRef};
use yrs::types::{Attrs, Change, Delta, EntryChange, Event, PathSegment};
use yrs::{Any, DeepObservable, Doc, Out, ReadTxn, Subscription, Text, Transact, TransactionMut};

use super::renderer::DiffRenderer;
use super::source::{
    Attributes, ChangeEvent, ChildDelta, SourceElement, SourceNode, SourceText, TextDelta, TextRun,
};
use crate::crdt::engine;

/// Convert the children of a fragment into a source tree.
pub fn fragment_to_source<T: ReadTxn>(fragment: &XmlFragmentRef, txn: &T) -> Vec<SourceNode> {
    fragment
        .children(txn)
        .map(|child| xml_to_source(&child, txn))
        .collect()
}

/// Render the named XML fragment of a document as it is now.
pub fn render_fragment(doc: &Doc, name: &str) -> DiffRenderer {
    let fragment = doc.get_or_insert_xml_fragment(name);
    let txn = doc.transact();
    DiffRenderer::new(&fragment_to_source(&fragment, &txn))
}

/// Records deep change events on a fragment as [`ChangeEvent`]s.
///
/// The observer only converts and queues. Events are applied to a renderer
/// after the transaction that produced them has been committed.
pub struct ChangeRecorder {
    queue: Arc<Mutex<Vec<ChangeEvent>>>,
    _subscription: Subscription,
}

impl ChangeRecorder {
    /// Start recording changes below `fragment`.
    pub fn observe(fragment: &XmlFragmentRef) -> Self {
        let queue: Arc<Mutex<Vec<ChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = queue.clone();
        let subscription = fragment.observe_deep(move |txn, events| {
            let converted: Vec<ChangeEvent> = events
                .iter()
                .filter_map(|event| convert_event(txn, event))
                .collect();
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(converted);
        });

        Self {
            queue,
            _subscription: subscription,
        }
    }

    /// Drain the events recorded so far, in emission order.
    pub fn take(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

fn convert_event(txn: &TransactionMut, event: &Event) -> Option<ChangeEvent> {
    match event {
        Event::XmlText(e) => Some(ChangeEvent::Text {
            path: index_path(e.path()),
            delta: e
                .delta(txn)
                .iter()
                .map(|d| match d {
                    Delta::Inserted(value, attrs) => TextDelta::Insert {
                        text: out_text(value, txn),
                        attributes: attrs.as_deref().map(attrs_to_json),
                    },
                    Delta::Deleted(len) => TextDelta::Delete(*len),
                    Delta::Retain(len, attrs) => TextDelta::Retain {
                        len: *len,
                        attributes: attrs.as_deref().map(attrs_to_json),
                    },
                })
                .collect(),
        }),
        Event::XmlFragment(e) => {
            let mut keys: Attributes = e
                .keys(txn)
                .iter()
                .map(|(key, change)| {
                    let value = match change {
                        EntryChange::Inserted(new) | EntryChange::Updated(_, new) => {
                            engine::out_to_json(new, txn)
                        }
                        EntryChange::Removed(_) => Value::Null,
                    };
                    (key.to_string(), value)
                })
                .collect();
            keys.sort_keys();

            Some(ChangeEvent::Element {
                path: index_path(e.path()),
                delta: e
                    .delta(txn)
                    .iter()
                    .map(|c| match c {
                        Change::Added(values) => ChildDelta::Insert(
                            values.iter().filter_map(|v| out_to_source(v, txn)).collect(),
                        ),
                        Change::Removed(n) => ChildDelta::Delete(*n),
                        Change::Retain(n) => ChildDelta::Retain(*n),
                    })
                    .collect(),
                keys,
            })
        }
        _ => None,
    }
}

fn index_path<I: IntoIterator<Item = PathSegment>>(path: I) -> Vec<u32> {
    path.into_iter()
        .filter_map(|segment| match segment {
            PathSegment::Index(i) => Some(i),
            PathSegment::Key(_) => None,
        })
        .collect()
}

fn out_to_source<T: ReadTxn>(value: &Out, txn: &T) -> Option<SourceNode> {
    match value {
        Out::YXmlElement(el) => Some(xml_to_source(&XmlOut::Element(el.clone()), txn)),
        Out::YXmlText(text) => Some(SourceNode::Text(text_to_source(text, txn))),
        Out::YXmlFragment(frag) => Some(xml_to_source(&XmlOut::Fragment(frag.clone()), txn)),
        other => {
            log::warn!("Ignoring non-XML child inserted into a fragment: {:?}", other);
            None
        }
    }
}

fn xml_to_source<T: ReadTxn>(node: &XmlOut, txn: &T) -> SourceNode {
    match node {
        XmlOut::Element(el) => {
            let mut attributes: Attributes = el
                .attributes(txn)
                .map(|(name, value)| (name.to_string(), engine::out_to_json(&value, txn)))
                .collect();
            attributes.sort_keys();
            SourceNode::Element(SourceElement {
                tag: el.tag().to_string(),
                attributes,
                children: el.children(txn).map(|c| xml_to_source(&c, txn)).collect(),
            })
        }
        XmlOut::Fragment(frag) => SourceNode::Element(SourceElement {
            tag: "fragment".into(),
            attributes: Attributes::new(),
            children: fragment_to_source(frag, txn),
        }),
        XmlOut::Text(text) => SourceNode::Text(text_to_source(text, txn)),
    }
}

fn text_to_source<T: ReadTxn>(text: &XmlTextRef, txn: &T) -> SourceText {
    SourceText {
        runs: text
            .diff(txn, YChange::identity)
            .into_iter()
            .map(|chunk| TextRun {
                text: out_text(&chunk.insert, txn),
                attributes: chunk
                    .attributes
                    .as_deref()
                    .map(attrs_to_json)
                    .unwrap_or_default(),
            })
            .collect(),
    }
}

fn out_text<T: ReadTxn>(value: &Out, txn: &T) -> String {
    match value {
        Out::Any(Any::String(s)) => s.to_string(),
        other => other.clone().to_string(txn),
    }
}

fn attrs_to_json(attrs: &Attrs) -> Attributes {
    let mut out: Attributes = attrs
        .iter()
        .map(|(k, v)| (k.to_string(), engine::any_to_json(v)))
        .collect();
    out.sort_keys();
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use yrs::types::xml::{Xml, XmlElementPrelim, XmlElementRef, XmlTextPrelim};

    const FIELD: &str = "contents";

    /// A document with one paragraph per entry of `paragraphs`.
    fn document(paragraphs: &[&str]) -> (Doc, XmlFragmentRef, Vec<(XmlElementRef, XmlTextRef)>) {
        let doc = engine::new_doc();
        let fragment = doc.get_or_insert_xml_fragment(FIELD);
        let nodes = {
            let mut txn = doc.transact_mut();
            paragraphs
                .iter()
                .map(|text| {
                    let p = fragment.push_back(&mut txn, XmlElementPrelim::empty("paragraph"));
                    let t = p.push_back(&mut txn, XmlTextPrelim::new(*text));
                    (p, t)
                })
                .collect()
        };
        (doc, fragment, nodes)
    }

    #[test]
    fn test_fragment_to_source() {
        let (doc, fragment, _) = document(&["hello"]);
        let txn = doc.transact();
        assert_eq!(
            fragment_to_source(&fragment, &txn),
            vec![SourceNode::from(
                SourceElement::new("paragraph").with_child(SourceText::plain("hello"))
            )]
        );
    }

    #[test]
    fn test_recorded_text_insert() {
        let (doc, fragment, nodes) = document(&["hello"]);
        let mut renderer = render_fragment(&doc, FIELD);
        let recorder = ChangeRecorder::observe(&fragment);

        {
            let mut txn = doc.transact_mut();
            nodes[0].1.insert(&mut txn, 5, " world");
        }

        let events = recorder.take();
        assert_eq!(
            events,
            vec![ChangeEvent::Text {
                path: vec![0, 0],
                delta: vec![
                    TextDelta::Retain {
                        len: 5,
                        attributes: None
                    },
                    TextDelta::Insert {
                        text: " world".into(),
                        attributes: None
                    },
                ],
            }]
        );
        for event in &events {
            renderer.apply(event).unwrap();
        }
        assert_eq!(
            renderer.to_xhtml(),
            "<p data-yjs-tag=\"paragraph\"><span>hello</span>\
             <span class=\"changeset-added\"> world</span></p>"
        );
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_recorded_formatting() {
        let (doc, fragment, nodes) = document(&["hello"]);
        let mut renderer = render_fragment(&doc, FIELD);
        let recorder = ChangeRecorder::observe(&fragment);

        {
            let mut txn = doc.transact_mut();
            let bold: Attrs = HashMap::from([(Arc::from("bold"), Any::Bool(true))]);
            nodes[0].1.format(&mut txn, 0, 2, bold);
        }

        for event in recorder.take() {
            renderer.apply(&event).unwrap();
        }
        assert_eq!(
            renderer.to_xhtml(),
            "<p data-yjs-tag=\"paragraph\"><span class=\"bold changeset-edited\">he</span>\
             <span>llo</span></p>"
        );
    }

    #[test]
    fn test_recorded_element_delete() {
        let (doc, fragment, _) = document(&["one", "two", "three"]);
        let mut renderer = render_fragment(&doc, FIELD);
        let recorder = ChangeRecorder::observe(&fragment);

        {
            let mut txn = doc.transact_mut();
            fragment.remove_range(&mut txn, 2, 1);
        }

        for event in recorder.take() {
            renderer.apply(&event).unwrap();
        }
        assert_eq!(
            renderer.to_xhtml(),
            "<p data-yjs-tag=\"paragraph\"><span>one</span></p>\
             <p data-yjs-tag=\"paragraph\"><span>two</span></p>\
             <p data-yjs-tag=\"paragraph\" class=\"changeset-deleted\"><span>three</span></p>"
        );
    }

    #[test]
    fn test_recorded_attribute_change() {
        let (doc, fragment, nodes) = document(&["hello"]);
        let mut renderer = render_fragment(&doc, FIELD);
        let recorder = ChangeRecorder::observe(&fragment);

        {
            let mut txn = doc.transact_mut();
            nodes[0].0.insert_attribute(&mut txn, "textAlign", "center");
        }

        for event in recorder.take() {
            renderer.apply(&event).unwrap();
        }
        assert_eq!(
            renderer.to_xhtml(),
            "<p data-yjs-tag=\"paragraph\" class=\"text-align-center changeset-edited\">\
             <span>hello</span></p>"
        );
    }
}
