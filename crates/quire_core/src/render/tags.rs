//! Element handlers, one per known tag.

use serde_json::Value;

use super::markup::{Markup, MarkupElement};

/// Element tags the renderer understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    /// `paragraph` → `p`
    Paragraph,
    /// `heading` (or `header`) → `h1`..`h6`
    Heading,
    /// `blockquote`
    Blockquote,
    /// `table`
    Table,
    /// `tableRow` → `tr`
    TableRow,
    /// `tableCell` → `td`
    TableCell,
    /// `tableHeader` → `th`
    TableHeader,
    /// `bulletList` → `ul`
    BulletList,
    /// `orderedList` → `ol`
    OrderedList,
    /// `listItem` → `li`
    ListItem,
    /// `hardBreak` → `br`
    HardBreak,
    /// `pageBreak` → a divider with a label
    PageBreak,
    /// `codeBlock` → `code.code-block`
    CodeBlock,
    /// Anything else
    Other(String),
}

impl Tag {
    /// Look up the handler for a stored tag name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "paragraph" => Tag::Paragraph,
            "heading" | "header" => Tag::Heading,
            "blockquote" => Tag::Blockquote,
            "table" => Tag::Table,
            "tableRow" => Tag::TableRow,
            "tableCell" => Tag::TableCell,
            "tableHeader" => Tag::TableHeader,
            "bulletList" => Tag::BulletList,
            "orderedList" => Tag::OrderedList,
            "listItem" => Tag::ListItem,
            "hardBreak" => Tag::HardBreak,
            "pageBreak" => Tag::PageBreak,
            "codeBlock" => Tag::CodeBlock,
            other => Tag::Other(other.to_string()),
        }
    }

    /// Apply element attributes (a full set at creation, or the changed keys
    /// of an event, `null` meaning removed) to `el`.
    pub fn apply<'a, I>(&self, el: &mut MarkupElement, changes: I)
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut classes = el.classes();

        match self {
            Tag::Paragraph => {
                el.tag = "p".into();
                apply_text_align(&mut classes, changes);
            }
            Tag::Heading => {
                for (name, value) in changes {
                    match name {
                        "level" => {
                            if let Some(level) = value.as_f64().filter(|l| {
                                l.fract() == 0.0 && (1.0..=6.0).contains(l)
                            }) {
                                el.tag = format!("h{}", level as u8);
                            }
                        }
                        "textAlign" => set_text_align(&mut classes, value),
                        _ => {}
                    }
                }
            }
            Tag::Blockquote => el.tag = "blockquote".into(),
            Tag::Table => el.tag = "table".into(),
            Tag::TableRow => el.tag = "tr".into(),
            Tag::TableCell => el.tag = "td".into(),
            Tag::TableHeader => el.tag = "th".into(),
            Tag::BulletList => el.tag = "ul".into(),
            Tag::OrderedList => el.tag = "ol".into(),
            Tag::ListItem => el.tag = "li".into(),
            Tag::HardBreak => el.tag = "br".into(),
            Tag::CodeBlock => {
                el.tag = "code".into();
                classes.push("code-block".into());
            }
            Tag::PageBreak => {
                el.tag = "div".into();
                if el.children.is_empty() {
                    el.children = page_break_children();
                }
            }
            Tag::Other(name) => {
                log::warn!("Unrecognized element tag: {}", name);
                el.tag = "div".into();
                classes.push("unrecognized-tag".into());
            }
        }

        el.set_classes(classes);
    }
}

fn apply_text_align<'a, I>(classes: &mut Vec<String>, changes: I)
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    for (name, value) in changes {
        if name == "textAlign" {
            set_text_align(classes, value);
        }
    }
}

fn set_text_align(classes: &mut Vec<String>, value: &Value) {
    classes.retain(|c| !c.starts_with("text-align-"));
    if let Some(align) = value.as_str() {
        classes.push(format!("text-align-{}", align));
    }
}

fn page_break_children() -> Vec<Markup> {
    let line = || {
        let mut el = MarkupElement::new("div");
        el.set_attribute("class", "page-break-line");
        Markup::Element(el)
    };
    let mut label = MarkupElement::new("div");
    label.set_attribute("class", "page-break-text");
    label.children.push(Markup::Text("Page Break".into()));

    vec![line(), Markup::Element(label), line()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(tag: &str, attrs: &[(&str, Value)]) -> MarkupElement {
        let mut el = MarkupElement::new("div");
        Tag::from_name(tag).apply(&mut el, attrs.iter().map(|(k, v)| (*k, v)));
        el
    }

    #[test]
    fn test_paragraph_alignment() {
        let el = render("paragraph", &[("textAlign", json!("center"))]);
        assert_eq!(el.tag, "p");
        assert_eq!(el.attribute("class"), Some("text-align-center"));

        let mut el = el;
        Tag::Paragraph.apply(&mut el, [("textAlign", &json!("right"))]);
        assert_eq!(el.attribute("class"), Some("text-align-right"));

        Tag::Paragraph.apply(&mut el, [("textAlign", &Value::Null)]);
        assert!(el.attribute("class").is_none());
    }

    #[test]
    fn test_heading_levels() {
        assert_eq!(render("heading", &[("level", json!(2))]).tag, "h2");
        assert_eq!(render("header", &[("level", json!(6.0))]).tag, "h6");
        assert_eq!(render("heading", &[("level", json!(9))]).tag, "div");
    }

    #[test]
    fn test_code_block_and_page_break() {
        let code = render("codeBlock", &[]);
        assert_eq!(code.tag, "code");
        assert!(code.has_class("code-block"));

        let page = render("pageBreak", &[]);
        assert_eq!(
            page.to_xhtml(),
            "<div><div class=\"page-break-line\"/><div class=\"page-break-text\">Page Break</div><div class=\"page-break-line\"/></div>"
        );
    }

    #[test]
    fn test_unknown_tag_degrades() {
        let el = render("mermaidDiagram", &[("foo", json!(1))]);
        assert_eq!(el.tag, "div");
        assert_eq!(el.attribute("class"), Some("unrecognized-tag"));
    }

    #[test]
    fn test_unknown_tag_keeps_change_classes() {
        let mut el = MarkupElement::new("div");
        el.set_classes(vec!["changeset-added".into()]);

        Tag::from_name("mermaidDiagram").apply(&mut el, [("foo", &json!(2))]);
        assert!(el.has_class("changeset-added"));
        assert!(el.has_class("unrecognized-tag"));
    }
}
