//! Engine-independent source tree and change events.
//!
//! These mirror a yrs XML fragment closely enough for rendering while staying
//! owned, so events can be queued inside an observer and applied later.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QuireError, Result};

/// Formatting or element attributes. A `null` value in a change means the
/// attribute was removed.
pub type Attributes = IndexMap<String, Value>;

/// A node of the source tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceNode {
    /// A tagged element
    Element(SourceElement),
    /// A run of formatted text
    Text(SourceText),
}

/// A tagged element with attributes and children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceElement {
    /// Tag name as stored in the document, e.g. `paragraph`
    pub tag: String,
    /// Element attributes
    #[serde(default)]
    pub attributes: Attributes,
    /// Child nodes
    #[serde(default)]
    pub children: Vec<SourceNode>,
}

impl SourceElement {
    /// Element with no attributes or children.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: Attributes::new(),
            children: Vec::new(),
        }
    }

    /// Builder: add an attribute.
    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Builder: add a child.
    pub fn with_child(mut self, child: impl Into<SourceNode>) -> Self {
        self.children.push(child.into());
        self
    }
}

impl From<SourceElement> for SourceNode {
    fn from(el: SourceElement) -> Self {
        SourceNode::Element(el)
    }
}

/// Text split into maximal runs of identical formatting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceText {
    /// Formatting runs in document order
    pub runs: Vec<TextRun>,
}

impl SourceText {
    /// Unformatted text.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            runs: vec![TextRun::plain(text)],
        }
    }

    /// Builder: add a run.
    pub fn with_run(mut self, run: TextRun) -> Self {
        self.runs.push(run);
        self
    }
}

impl From<SourceText> for SourceNode {
    fn from(text: SourceText) -> Self {
        SourceNode::Text(text)
    }
}

/// One formatting run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRun {
    /// Run content
    pub text: String,
    /// Marks applied to the run
    #[serde(default)]
    pub attributes: Attributes,
}

impl TextRun {
    /// Run without formatting.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: Attributes::new(),
        }
    }

    /// Builder: add a mark.
    pub fn with_mark(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }
}

/// One operation of a text change. Lengths are UTF-16 code units.
#[derive(Debug, Clone, PartialEq)]
pub enum TextDelta {
    /// Skip `len` units, optionally changing their formatting
    Retain {
        /// Units skipped
        len: u32,
        /// Formatting changes, if any
        attributes: Option<Attributes>,
    },
    /// Remove `len` units
    Delete(u32),
    /// Insert new text
    Insert {
        /// Inserted content
        text: String,
        /// Formatting of the inserted content
        attributes: Option<Attributes>,
    },
}

impl TextDelta {
    /// Parse a delta operation in the usual JSON form:
    /// `{"retain": n, "attributes": {..}}`, `{"delete": n}` or
    /// `{"insert": "text", "attributes": {..}}`.
    pub fn from_json(op: &Value) -> Result<Self> {
        let obj = op
            .as_object()
            .ok_or_else(|| malformed("text delta", op))?;
        let attributes = match obj.get("attributes") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Some(_) => return Err(malformed("text delta", op)),
        };

        if let Some(len) = obj.get("retain") {
            let len = json_len(len).ok_or_else(|| malformed("text delta", op))?;
            Ok(TextDelta::Retain { len, attributes })
        } else if let Some(len) = obj.get("delete") {
            let len = json_len(len).ok_or_else(|| malformed("text delta", op))?;
            Ok(TextDelta::Delete(len))
        } else if let Some(text) = obj.get("insert").and_then(Value::as_str) {
            Ok(TextDelta::Insert {
                text: text.to_string(),
                attributes,
            })
        } else {
            Err(malformed("text delta", op))
        }
    }
}

/// One operation of an element's child list change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildDelta {
    /// Skip `n` children
    Retain(u32),
    /// Insert new children
    Insert(Vec<SourceNode>),
    /// Remove `n` children
    Delete(u32),
}

impl ChildDelta {
    /// Parse `{"retain": n}`, `{"delete": n}` or `{"insert": [nodes]}`.
    pub fn from_json(op: &Value) -> Result<Self> {
        let obj = op
            .as_object()
            .ok_or_else(|| malformed("child delta", op))?;

        if let Some(n) = obj.get("retain") {
            json_len(n)
                .map(ChildDelta::Retain)
                .ok_or_else(|| malformed("child delta", op))
        } else if let Some(n) = obj.get("delete") {
            json_len(n)
                .map(ChildDelta::Delete)
                .ok_or_else(|| malformed("child delta", op))
        } else if let Some(nodes) = obj.get("insert") {
            let nodes: Vec<SourceNode> = serde_json::from_value(nodes.clone())
                .map_err(|e| QuireError::MalformedEvent(format!("bad inserted nodes: {}", e)))?;
            Ok(ChildDelta::Insert(nodes))
        } else {
            Err(malformed("child delta", op))
        }
    }
}

/// A change to one node of the tree, addressed by child indices from the
/// fragment root.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// Characters or formatting of a text node changed. The path ends at the
    /// text node itself.
    Text {
        /// Child indices from the root to the text node
        path: Vec<u32>,
        /// Operations in document order
        delta: Vec<TextDelta>,
    },
    /// Children or attributes of an element (or the root) changed.
    Element {
        /// Child indices from the root to the element
        path: Vec<u32>,
        /// Child list operations in document order
        delta: Vec<ChildDelta>,
        /// New attribute values; `null` for removed attributes
        keys: Attributes,
    },
}

fn json_len(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

fn malformed(what: &str, op: &Value) -> QuireError {
    QuireError::MalformedEvent(format!("unrecognized {}: {}", what, op))
}
