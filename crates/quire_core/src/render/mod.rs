#![doc = include_str!(concat!(env!("OUT_DIR"), "/render_README.md"))]

mod marks;
mod markup;
mod renderer;
mod source;
mod tags;
pub mod yxml;

pub use marks::{Mark, apply_marks};
pub use markup::{Markup, MarkupElement, to_xhtml};
pub use renderer::DiffRenderer;
pub use source::{
    Attributes, ChangeEvent, ChildDelta, SourceElement, SourceNode, SourceText, TextDelta, TextRun,
};
pub use tags::Tag;
pub use yxml::{ChangeRecorder, fragment_to_source, render_fragment};
