//! Owned XHTML tree produced by the renderer.

use indexmap::IndexMap;

/// A node of rendered markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Markup {
    /// An element with attributes and children
    Element(MarkupElement),
    /// Character data
    Text(String),
}

impl Markup {
    /// Borrow as an element, if this is one.
    pub fn as_element(&self) -> Option<&MarkupElement> {
        match self {
            Markup::Element(el) => Some(el),
            Markup::Text(_) => None,
        }
    }

    /// Mutably borrow as an element, if this is one.
    pub fn as_element_mut(&mut self) -> Option<&mut MarkupElement> {
        match self {
            Markup::Element(el) => Some(el),
            Markup::Text(_) => None,
        }
    }

    fn write_xhtml(&self, out: &mut String) {
        match self {
            Markup::Text(text) => out.push_str(&escape(text, false)),
            Markup::Element(el) => el.write_xhtml(out),
        }
    }
}

/// A markup element. Attribute order is insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupElement {
    /// Output tag name
    pub tag: String,
    /// Attributes in insertion order
    pub attributes: IndexMap<String, String>,
    /// Child nodes
    pub children: Vec<Markup>,
}

impl MarkupElement {
    /// Create an element with no attributes or children.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: IndexMap::new(),
            children: Vec::new(),
        }
    }

    /// A `span` holding a single text node.
    pub fn span(text: impl Into<String>) -> Self {
        let mut span = Self::new("span");
        span.children.push(Markup::Text(text.into()));
        span
    }

    /// Get an attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Set an attribute, keeping its position if it already exists.
    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    /// Remove an attribute.
    pub fn remove_attribute(&mut self, name: &str) {
        self.attributes.shift_remove(name);
    }

    /// Classes currently on the element, in attribute order.
    pub fn classes(&self) -> Vec<String> {
        self.attribute("class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Whether the element carries `class`.
    pub fn has_class(&self, class: &str) -> bool {
        self.attribute("class")
            .is_some_and(|c| c.split_whitespace().any(|existing| existing == class))
    }

    /// Replace the class list. Classes are sorted and deduplicated; an empty
    /// list removes the attribute.
    pub fn set_classes<I, S>(&mut self, classes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut classes: Vec<String> = classes.into_iter().map(Into::into).collect();
        classes.sort();
        classes.dedup();
        if classes.is_empty() {
            self.remove_attribute("class");
        } else {
            self.set_attribute("class", classes.join(" "));
        }
    }

    /// Append a class after the existing ones.
    pub fn add_class(&mut self, class: &str) {
        if self.has_class(class) {
            return;
        }
        match self.attributes.get_mut("class") {
            Some(existing) if !existing.is_empty() => {
                existing.push(' ');
                existing.push_str(class);
            }
            _ => self.set_attribute("class", class),
        }
    }

    /// Text of a span created by [`MarkupElement::span`].
    pub fn span_text(&self) -> Option<&str> {
        match self.children.as_slice() {
            [Markup::Text(text)] => Some(text),
            _ => None,
        }
    }

    /// Serialize as XHTML.
    pub fn to_xhtml(&self) -> String {
        let mut out = String::new();
        self.write_xhtml(&mut out);
        out
    }

    fn write_xhtml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attributes {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape(value, true));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            child.write_xhtml(out);
        }
        out.push_str("</");
        out.push_str(&self.tag);
        out.push('>');
    }
}

/// Serialize a sequence of nodes as XHTML.
pub fn to_xhtml(nodes: &[Markup]) -> String {
    let mut out = String::new();
    for node in nodes {
        node.write_xhtml(&mut out);
    }
    out
}

fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
