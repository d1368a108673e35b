//! View rendering boundary
//!
//! Template engines are pluggable: the core only calls this trait from
//! `Signal::render`. No engine ships with the library.

use serde_json::Value;

use crate::error::Result;

/// Renders templates to HTML strings
pub trait ViewRenderer: Send + Sync {
    /// Render an in-memory template source with a JSON context
    fn render_string(&self, source: &str, ctx: &Value) -> Result<String>;

    /// Render a template by bundle-relative path with a JSON context
    fn render_file(&self, path: &str, ctx: &Value) -> Result<String>;
}
