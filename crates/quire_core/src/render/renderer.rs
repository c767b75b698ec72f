use super::marks::apply_marks;
use super::markup::{self, Markup, MarkupElement};
use super::source::{Attributes, ChangeEvent, ChildDelta, SourceElement, SourceNode, SourceText, TextDelta};
use super::tags::Tag;
use crate::error::{QuireError, Result};

const ADDED: &str = "changeset-added";
const EDITED: &str = "changeset-edited";
const DELETED: &str = "changeset-deleted";

/// Renders a source tree to XHTML and marks up incremental changes on it.
///
/// The markup keeps the source's child ordering: element `i` of a source node
/// is markup child `i`, and a text node becomes one `span` per formatting run
/// directly inside its parent. Change events must be applied in the order the
/// engine emitted them.
#[derive(Debug, Clone)]
pub struct DiffRenderer {
    root: MarkupElement,
}

/// Position inside a run of spans: span index and UTF-16 offset into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    span: usize,
    offset: u32,
}

/// A traversed part of one span. `end == None` means to the end of the span.
#[derive(Debug, Clone, Copy)]
struct Segment {
    span: usize,
    start: u32,
    end: Option<u32>,
}

impl DiffRenderer {
    /// Render the children of a fragment.
    pub fn new(nodes: &[SourceNode]) -> Self {
        let mut root = MarkupElement::new("fragment");
        for node in nodes {
            root.children.extend(render_node(node));
        }
        Self { root }
    }

    /// Rendered top-level nodes.
    pub fn nodes(&self) -> &[Markup] {
        &self.root.children
    }

    /// Serialize the current markup.
    pub fn to_xhtml(&self) -> String {
        markup::to_xhtml(&self.root.children)
    }

    /// Apply one change event. On error the markup is left as it was.
    pub fn apply(&mut self, event: &ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::Text { path, delta } => self.apply_text_event(path, delta),
            ChangeEvent::Element { path, delta, keys } => {
                self.apply_element_event(path, delta, keys)
            }
        }
    }

    /// Mark up a change to a text node. `path` ends at the text node, which
    /// must be the first child of its parent.
    pub fn apply_text_event(&mut self, path: &[u32], delta: &[TextDelta]) -> Result<()> {
        let (last, parent_path) = path
            .split_last()
            .ok_or_else(|| QuireError::MalformedEvent("empty path for text event".into()))?;
        if *last != 0 {
            return Err(QuireError::MalformedEvent(format!(
                "text node at {:?} is not the first child of its parent",
                path
            )));
        }

        let mut root = self.root.clone();
        let parent = node_at(&mut root, parent_path)?;
        apply_text_delta(&mut parent.children, delta)?;
        self.root = root;
        Ok(())
    }

    /// Mark up a change to an element's attributes and children.
    pub fn apply_element_event(
        &mut self,
        path: &[u32],
        delta: &[ChildDelta],
        keys: &Attributes,
    ) -> Result<()> {
        let mut root = self.root.clone();
        let node = node_at(&mut root, path)?;

        if !keys.is_empty() {
            if path.is_empty() {
                return Err(QuireError::MalformedEvent(
                    "attribute change on the fragment root".into(),
                ));
            }
            let tag = node.attribute("data-yjs-tag").unwrap_or_default().to_string();
            Tag::from_name(&tag).apply(node, keys.iter().map(|(k, v)| (k.as_str(), v)));
            node.add_class(EDITED);
        }

        let mut index = 0usize;
        for op in delta {
            match op {
                ChildDelta::Retain(n) => {
                    index += *n as usize;
                    if index > node.children.len() {
                        return Err(QuireError::MalformedEvent(format!(
                            "retain past the last child at {:?}",
                            path
                        )));
                    }
                }
                ChildDelta::Insert(nodes) => {
                    for mut inserted in nodes.iter().flat_map(render_node) {
                        if let Some(el) = inserted.as_element_mut() {
                            el.add_class(ADDED);
                        }
                        if index > node.children.len() {
                            return Err(QuireError::MalformedEvent(format!(
                                "insert past the last child at {:?}",
                                path
                            )));
                        }
                        node.children.insert(index, inserted);
                        index += 1;
                    }
                }
                ChildDelta::Delete(n) => {
                    for _ in 0..*n {
                        let child = node
                            .children
                            .get_mut(index)
                            .and_then(Markup::as_element_mut)
                            .ok_or_else(|| {
                                QuireError::MalformedEvent(format!(
                                    "delete past the last child at {:?}",
                                    path
                                ))
                            })?;
                        child.add_class(DELETED);
                        index += 1;
                    }
                }
            }
        }

        self.root = root;
        Ok(())
    }
}

fn node_at<'a>(root: &'a mut MarkupElement, path: &[u32]) -> Result<&'a mut MarkupElement> {
    let mut node = root;
    for &index in path {
        node = node
            .children
            .get_mut(index as usize)
            .and_then(Markup::as_element_mut)
            .ok_or_else(|| {
                QuireError::MalformedEvent(format!("path {:?} does not match the tree", path))
            })?;
    }
    Ok(node)
}

fn render_node(node: &SourceNode) -> Vec<Markup> {
    match node {
        SourceNode::Element(el) => vec![Markup::Element(render_element(el))],
        SourceNode::Text(text) => render_text(text),
    }
}

fn render_element(source: &SourceElement) -> MarkupElement {
    let mut el = MarkupElement::new("div");
    el.set_attribute("data-yjs-tag", source.tag.as_str());
    Tag::from_name(&source.tag).apply(
        &mut el,
        source.attributes.iter().map(|(k, v)| (k.as_str(), v)),
    );
    for child in &source.children {
        el.children.extend(render_node(child));
    }
    el
}

fn render_text(text: &SourceText) -> Vec<Markup> {
    text.runs
        .iter()
        .map(|run| Markup::Element(text_span(&run.text, Some(&run.attributes))))
        .collect()
}

fn text_span(text: &str, attributes: Option<&Attributes>) -> MarkupElement {
    let mut span = MarkupElement::span(text);
    if let Some(attributes) = attributes.filter(|a| !a.is_empty()) {
        apply_marks(&mut span, attributes);
    }
    span
}

fn apply_text_delta(spans: &mut Vec<Markup>, delta: &[TextDelta]) -> Result<()> {
    let mut cursor = Cursor { span: 0, offset: 0 };

    for op in delta {
        match op {
            TextDelta::Retain { len, attributes } => {
                let segments = advance(spans, &mut cursor, *len)?;
                let Some(attributes) = attributes.as_ref().filter(|a| !a.is_empty()) else {
                    continue;
                };
                for segment in segments.into_iter().rev() {
                    let index = isolate(spans, segment, &mut cursor)?;
                    let span = span_mut(spans, index)?;
                    apply_marks(span, attributes);
                    span.add_class(EDITED);
                }
            }
            TextDelta::Delete(len) => {
                let segments = advance(spans, &mut cursor, *len)?;
                for segment in segments.into_iter().rev() {
                    let index = isolate(spans, segment, &mut cursor)?;
                    span_mut(spans, index)?.add_class(DELETED);
                }
            }
            TextDelta::Insert { text, attributes } => {
                if cursor.offset != 0 {
                    let at = cursor.offset;
                    split(spans, cursor.span, at, &mut cursor)?;
                }
                let mut span = text_span(text, attributes.as_ref());
                span.add_class(ADDED);
                spans.insert(cursor.span, Markup::Element(span));
                cursor.span += 1;
            }
        }
    }
    Ok(())
}

/// Move the cursor `len` units forward, returning the span parts crossed.
fn advance(spans: &[Markup], cursor: &mut Cursor, mut len: u32) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    while len > 0 {
        let span_len = span(spans, cursor.span)
            .map_err(|_| QuireError::MalformedEvent("delta runs past the end of the text".into()))?
            .span_text()
            .map(utf16_len)
            .unwrap_or_default();

        let reach = cursor
            .offset
            .checked_add(len)
            .ok_or_else(|| QuireError::MalformedEvent(format!("delta length {} overflows", len)))?;

        if reach >= span_len {
            segments.push(Segment {
                span: cursor.span,
                start: cursor.offset,
                end: None,
            });
            len = reach - span_len;
            cursor.span += 1;
            cursor.offset = 0;
        } else {
            segments.push(Segment {
                span: cursor.span,
                start: cursor.offset,
                end: Some(reach),
            });
            cursor.offset = reach;
            len = 0;
        }
    }
    Ok(segments)
}

/// Split so that exactly the segment's text sits in its own span; returns the
/// index of that span. Later segments must be isolated first.
fn isolate(spans: &mut Vec<Markup>, segment: Segment, cursor: &mut Cursor) -> Result<usize> {
    let mut index = segment.span;
    if let Some(end) = segment.end {
        split(spans, index, end, cursor)?;
    }
    if segment.start != 0 {
        split(spans, index, segment.start, cursor)?;
        index += 1;
    }
    Ok(index)
}

/// Split span `index` at UTF-16 offset `at`. Both halves keep the span's tag
/// and attributes.
fn split(spans: &mut Vec<Markup>, index: usize, at: u32, cursor: &mut Cursor) -> Result<()> {
    let original = span(spans, index)?;
    let text = original
        .span_text()
        .ok_or_else(|| QuireError::MalformedEvent(format!("child {} is not a text span", index)))?;
    let byte = utf16_to_byte(text, at).ok_or_else(|| {
        QuireError::MalformedEvent(format!("offset {} is not a character boundary", at))
    })?;

    let mut left = original.clone();
    let mut right = original.clone();
    left.children = vec![Markup::Text(text[..byte].to_string())];
    right.children = vec![Markup::Text(text[byte..].to_string())];

    spans[index] = Markup::Element(left);
    spans.insert(index + 1, Markup::Element(right));

    if cursor.span == index && cursor.offset >= at {
        cursor.span += 1;
        cursor.offset -= at;
    } else if cursor.span > index {
        cursor.span += 1;
    }
    Ok(())
}

fn span(spans: &[Markup], index: usize) -> Result<&MarkupElement> {
    spans
        .get(index)
        .and_then(Markup::as_element)
        .ok_or_else(|| QuireError::MalformedEvent(format!("no text span at {}", index)))
}

fn span_mut(spans: &mut [Markup], index: usize) -> Result<&mut MarkupElement> {
    spans
        .get_mut(index)
        .and_then(Markup::as_element_mut)
        .ok_or_else(|| QuireError::MalformedEvent(format!("no text span at {}", index)))
}

fn utf16_len(text: &str) -> u32 {
    text.encode_utf16().count() as u32
}

fn utf16_to_byte(text: &str, at: u32) -> Option<usize> {
    let mut units = 0u32;
    for (byte, c) in text.char_indices() {
        if units == at {
            return Some(byte);
        }
        if units > at {
            return None;
        }
        units += c.len_utf16() as u32;
    }
    (units == at).then_some(text.len())
}
