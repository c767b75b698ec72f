#![doc = include_str!(concat!(env!("OUT_DIR"), "/README.md"))]
#![warn(missing_docs)]

/// Configuration options
pub mod config;

/// Error (common error types)
pub mod error;

/// CRDT engine boundary, storage and history replay
pub mod crdt;

/// Debounced, coalescing write coordination
pub mod coordinator;

/// Incremental diff rendering of XML fragments to XHTML
pub mod render;

/// Paginated history and per-entry before/after views
pub mod history_view;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{QuireError, Result};
