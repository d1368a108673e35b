//! Request lifecycle engine
//!
//! Everything that runs inside the worker process once a connection has
//! been delivered: route resolution, controller chains, body parsing and
//! response finalization.

pub mod bodyparser;
pub mod chain;
pub mod handler;
pub mod iterator;
pub mod middlewares;
pub mod router;
pub mod signal;

pub use bodyparser::{MultipartEvent, MultipartParser};
pub use chain::{AsyncOp, Controller, Coroutine, OpCallback, Resume, Step, Yielded};
pub use handler::{App, AppBuilder, AppSetup};
pub use router::{Method, Phase, RouteTable, RouterBuilder};
pub use signal::{Body, Payload, Signal, UploadedFile};

use serde::{Deserialize, Serialize};

/// Parsed request head plus buffered body, captured by the embedder before
/// the connection is handed off. Travels over the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Uppercase HTTP method
    pub method: String,
    /// Path component only, no query string
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: String,
    /// Header name/value pairs in arrival order
    pub headers: Vec<(String, String)>,
    /// Buffered request body
    pub body: Vec<u8>,
    /// `1.0` or `1.1`
    pub http_version: String,
    /// Host the client addressed, without the port
    pub hostname: String,
    /// Peer address, if the transport knows one
    pub remote_addr: Option<String>,
}

impl RequestMeta {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = query.to_string();
        self
    }
}

impl Default for RequestMeta {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: "/".to_string(),
            query: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
            http_version: "1.1".to_string(),
            hostname: "localhost".to_string(),
            remote_addr: None,
        }
    }
}
