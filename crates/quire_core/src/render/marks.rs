//! Text mark handlers.

use serde_json::Value;

use super::markup::MarkupElement;

const LINK_REL: &str = "noopener noreferrer nofollow";

/// Text marks the renderer understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    /// `bold`
    Bold,
    /// `italic`
    Italic,
    /// `strike`
    Strike,
    /// `underline`
    Underline,
    /// Inline `code`
    Code,
    /// `link`; the run becomes an `a`
    Link,
    /// Anything else
    Other(String),
}

impl Mark {
    /// Look up the handler for a mark name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "bold" => Mark::Bold,
            "italic" => Mark::Italic,
            "strike" => Mark::Strike,
            "underline" => Mark::Underline,
            "code" => Mark::Code,
            "link" => Mark::Link,
            other => Mark::Other(other.to_string()),
        }
    }

    fn apply(&self, el: &mut MarkupElement, value: &Value, classes: &mut Vec<String>) {
        let class = match self {
            Mark::Bold => "bold",
            Mark::Italic => "italic",
            Mark::Strike => "strike",
            Mark::Underline => "underline",
            Mark::Code => "code",
            Mark::Link => {
                apply_link(el, value);
                return;
            }
            Mark::Other(name) => {
                log::warn!("Unrecognized mark: {}", name);
                classes.push("unrecognized-mark".into());
                return;
            }
        };
        classes.retain(|c| c != class);
        if !value.is_null() {
            classes.push(class.into());
        }
    }
}

/// Apply formatting (a full set at creation, or the changed marks of a retain,
/// `null` meaning removed) to a text span.
pub fn apply_marks<'a, I>(el: &mut MarkupElement, changes: I)
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut classes = el.classes();
    for (name, value) in changes {
        Mark::from_name(name).apply(el, value, &mut classes);
    }
    el.set_classes(classes);
}

fn apply_link(el: &mut MarkupElement, value: &Value) {
    let href = match value {
        Value::String(href) => Some(href.as_str()),
        Value::Object(attrs) => attrs.get("href").and_then(Value::as_str),
        _ => None,
    };
    match href {
        Some(href) => {
            el.tag = "a".into();
            el.set_attribute("href", href);
            el.set_attribute("rel", LINK_REL);
            el.set_attribute("target", "_blank");
        }
        None => {
            el.tag = "span".into();
            el.remove_attribute("href");
            el.remove_attribute("rel");
            el.remove_attribute("target");
        }
    }
}
