//! Per-request context
//!
//! A [`Signal`] wraps one delivered connection for the lifetime of one
//! request: the immutable parsed request on one side, the mutable response
//! state on the other. Controllers share it behind an `Arc` and may touch
//! it from any thread; the response is guarded so that exactly one terminal
//! write ever happens no matter how many times `end` is called.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde_json::Value;

use crate::conn::Conn;
use crate::error::{GulError, Result};
use crate::http::chain::ChainBarrier;
use crate::http::router::Route;
use crate::http::RequestMeta;
use crate::sync::lock;
use crate::view::ViewRenderer;

/// Parsed request body
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    /// `application/x-www-form-urlencoded`
    Form(HashMap<String, String>),
    /// `application/json`
    Json(Value),
    /// Multipart form fields (files are kept separately on the signal)
    Multipart(HashMap<String, String>),
    /// XML kept as text
    Xml(String),
    /// Anything else, untouched
    Raw(Vec<u8>),
}

/// An uploaded multipart file
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// What a controller hands to `end`
pub enum Payload {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}

impl From<()> for Payload {
    fn from(_: ()) -> Self {
        Payload::Empty
    }
}

struct ResponseState {
    status: u16,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    responded: bool,
    stopped: bool,
    conn: Option<Box<dyn Conn>>,
}

/// One request in flight
pub struct Signal {
    method: String,
    path: String,
    http_version: String,
    hostname: String,
    remote_addr: Option<String>,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    raw_body: Vec<u8>,

    params: Mutex<HashMap<String, String>>,
    body: Mutex<Body>,
    files: Mutex<HashMap<String, UploadedFile>>,
    response: Mutex<ResponseState>,
    barrier: Mutex<Option<Arc<ChainBarrier>>>,
    route: Mutex<Option<Arc<Route>>>,
    observers: Mutex<Vec<Box<dyn FnOnce(bool) + Send>>>,
    renderer: Option<Arc<dyn ViewRenderer>>,
}

impl Signal {
    /// Build a signal around a delivered connection. Default response
    /// headers are applied up front and may be overwritten by controllers.
    pub fn new(
        meta: &RequestMeta,
        conn: Box<dyn Conn>,
        default_headers: &[(String, String)],
        renderer: Option<Arc<dyn ViewRenderer>>,
    ) -> Arc<Signal> {
        let query = url::form_urlencoded::parse(meta.query.as_bytes())
            .into_owned()
            .collect();
        let headers = meta
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        Arc::new(Signal {
            method: meta.method.clone(),
            path: meta.path.clone(),
            http_version: meta.http_version.clone(),
            hostname: meta.hostname.clone(),
            remote_addr: meta.remote_addr.clone(),
            query,
            headers,
            raw_body: meta.body.clone(),
            params: Mutex::new(HashMap::new()),
            body: Mutex::new(Body::Empty),
            files: Mutex::new(HashMap::new()),
            response: Mutex::new(ResponseState {
                status: 200,
                reason: None,
                headers: default_headers.to_vec(),
                responded: false,
                stopped: false,
                conn: Some(conn),
            }),
            barrier: Mutex::new(None),
            route: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            renderer,
        })
    }

    // --- request side -----------------------------------------------------

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }

    /// Request header by name, case-insensitive
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    pub fn param(&self, name: &str) -> Option<String> {
        lock(&self.params).get(name).cloned()
    }

    pub fn params(&self) -> HashMap<String, String> {
        lock(&self.params).clone()
    }

    pub fn merge_params(&self, captures: Vec<(String, String)>) {
        let mut params = lock(&self.params);
        for (name, value) in captures {
            params.insert(name, value);
        }
    }

    pub fn body(&self) -> Body {
        lock(&self.body).clone()
    }

    pub fn set_body(&self, body: Body) {
        *lock(&self.body) = body;
    }

    pub fn files(&self) -> HashMap<String, UploadedFile> {
        lock(&self.files).clone()
    }

    pub fn add_file(&self, file: UploadedFile) {
        lock(&self.files).insert(file.name.clone(), file);
    }

    // --- routing state ----------------------------------------------------

    pub(crate) fn set_route(&self, route: Arc<Route>) {
        *lock(&self.route) = Some(route);
    }

    pub(crate) fn route(&self) -> Option<Arc<Route>> {
        lock(&self.route).clone()
    }

    pub(crate) fn arm_chain(&self, barrier: Arc<ChainBarrier>) {
        *lock(&self.barrier) = Some(barrier);
    }

    pub(crate) fn disarm_chain(&self) {
        *lock(&self.barrier) = None;
    }

    /// Mark the current controller as complete. Callable from any thread;
    /// a no-op outside chain execution.
    pub fn ret(&self) {
        let barrier = lock(&self.barrier).clone();
        if let Some(barrier) = barrier {
            barrier.arrive();
        }
    }

    // --- response side ----------------------------------------------------

    pub fn status(&self, code: u16) {
        lock(&self.response).status = code;
    }

    pub fn status_with(&self, code: u16, reason: &str) {
        let mut resp = lock(&self.response);
        resp.status = code;
        resp.reason = Some(reason.to_string());
    }

    pub fn status_code(&self) -> u16 {
        lock(&self.response).status
    }

    /// Response header by name, case-insensitive
    pub fn header(&self, name: &str) -> Option<String> {
        lock(&self.response)
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn set_header(&self, name: &str, value: &str) {
        set_header_in(&mut lock(&self.response).headers, name, value);
    }

    pub fn remove_header(&self, name: &str) {
        lock(&self.response)
            .headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn responded(&self) -> bool {
        lock(&self.response).responded
    }

    pub fn stopped(&self) -> bool {
        lock(&self.response).stopped
    }

    /// Abort the remaining pipeline without writing anything
    pub fn stop(&self) {
        lock(&self.response).stopped = true;
    }

    /// Observer fired exactly once when the response is finalized. If the
    /// signal already responded, fires immediately.
    pub fn on_end(&self, f: impl FnOnce(bool) + Send + 'static) {
        if self.responded() {
            f(true);
        } else {
            lock(&self.observers).push(Box::new(f));
        }
    }

    /// Finalize the response. The first call writes; later calls are no-ops.
    pub fn end(&self, payload: impl Into<Payload>) {
        self.end_impl(payload.into(), false);
    }

    /// Finalize and stop the pipeline
    pub fn end_last(&self, payload: impl Into<Payload>) {
        self.end_impl(payload.into(), true);
    }

    pub fn json(&self, value: Value) {
        self.end(Payload::Json(value));
    }

    pub fn text(&self, body: impl Into<String>) {
        self.end(Payload::Text(body.into()));
    }

    pub fn html(&self, body: impl Into<String>) {
        self.set_header("Content-Type", "text/html");
        self.end(Payload::Text(body.into()));
    }

    pub fn redirect(&self, location: &str, status: u16) {
        self.set_header("Location", location);
        self.status(status);
        self.end(Payload::Empty);
    }

    /// Render a template source through the configured view renderer
    pub fn render(&self, source: &str, ctx: &Value) -> Result<()> {
        let renderer = self
            .renderer
            .as_ref()
            .ok_or_else(|| GulError::Render("no view renderer configured".to_string()))?;
        let html = renderer.render_string(source, ctx)?;
        self.html(html);
        Ok(())
    }

    /// Render a template file through the configured view renderer
    pub fn render_view(&self, path: &str, ctx: &Value) -> Result<()> {
        let renderer = self
            .renderer
            .as_ref()
            .ok_or_else(|| GulError::Render("no view renderer configured".to_string()))?;
        let html = renderer.render_file(path, ctx)?;
        self.html(html);
        Ok(())
    }

    /// Internal error path: plain 500 write, no negotiation, always stops
    pub(crate) fn fail(&self, body: &str) {
        let mut resp = lock(&self.response);
        if resp.responded {
            resp.stopped = true;
            return;
        }
        resp.responded = true;
        resp.stopped = true;
        resp.status = 500;
        set_header_in(&mut resp.headers, "Content-Type", "text/plain");
        set_header_in(&mut resp.headers, "Content-Length", &body.len().to_string());
        set_header_in(&mut resp.headers, "Connection", "close");
        let head = serialize_head(&self.http_version, 500, resp.reason.as_deref(), &resp.headers);
        if let Some(conn) = resp.conn.as_mut() {
            let written = conn
                .write_all(head.as_bytes())
                .and_then(|_| conn.write_all(body.as_bytes()))
                .and_then(|_| conn.flush());
            if let Err(e) = written {
                tracing::warn!(error = %e, "failed to write error response");
            }
        }
        if let Some(conn) = resp.conn.take() {
            let _ = conn.shutdown_both();
        }
        drop(resp);
        self.fire_observers();
    }

    fn end_impl(&self, payload: Payload, last: bool) {
        let mut resp = lock(&self.response);
        if resp.responded || resp.stopped {
            if last {
                resp.stopped = true;
            }
            return;
        }
        resp.responded = true;

        // A JSON body, an XHR marker or a token-bearing Authorization
        // header all request JSON serialization.
        let json_wanted = match &payload {
            Payload::Json(_) => true,
            Payload::Text(_) => self.wants_json(),
            Payload::Bytes(_) | Payload::Empty => false,
        };
        let mut bytes = match payload {
            Payload::Json(value) => serde_json::to_vec(&value).unwrap_or_default(),
            Payload::Text(text) if json_wanted => serde_json::to_vec(&text).unwrap_or_default(),
            Payload::Text(text) => text.into_bytes(),
            Payload::Bytes(bytes) => bytes,
            Payload::Empty => Vec::new(),
        };
        if json_wanted {
            set_header_in(&mut resp.headers, "Content-Type", "application/json");
        }

        // Content-encoding negotiation, unless the response already opted
        // out or carries its own encoding. Empty bodies are never encoded.
        let vary_set = resp
            .headers
            .iter()
            .any(|(n, v)| n.eq_ignore_ascii_case("vary") && v.eq_ignore_ascii_case("accept-encoding"));
        let already_encoded = resp.headers.iter().any(|(n, v)| {
            n.eq_ignore_ascii_case("content-encoding")
                && (v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("deflate"))
        });
        if !bytes.is_empty() && !vary_set && !already_encoded {
            if let Some(accept) = self.request_header("accept-encoding") {
                let encoding = if accept
                    .split(',')
                    .any(|e| e.trim().eq_ignore_ascii_case("gzip"))
                {
                    "gzip"
                } else {
                    "deflate"
                };
                if let Ok(encoded) = compress(encoding, &bytes) {
                    bytes = encoded;
                    set_header_in(&mut resp.headers, "Content-Encoding", encoding);
                    set_header_in(&mut resp.headers, "Vary", "Accept-Encoding");
                }
            }
        }

        set_header_in(&mut resp.headers, "Content-Length", &bytes.len().to_string());
        if resp.status == 200 && bytes.is_empty() {
            resp.status = 204;
        }

        let head = serialize_head(
            &self.http_version,
            resp.status,
            resp.reason.as_deref(),
            &resp.headers,
        );
        if let Some(conn) = resp.conn.as_mut() {
            let written = conn.write_all(head.as_bytes()).and_then(|_| {
                if self.method != "HEAD" {
                    conn.write_all(&bytes)?;
                }
                conn.flush()
            });
            if let Err(e) = written {
                tracing::warn!(error = %e, path = %self.path, "failed to write response");
            }
        }

        let close = resp
            .headers
            .iter()
            .any(|(n, v)| n.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close"));
        if close {
            if let Some(conn) = resp.conn.take() {
                let _ = conn.shutdown_both();
            }
        }
        if last {
            resp.stopped = true;
        }
        drop(resp);
        self.fire_observers();
    }

    fn fire_observers(&self) {
        let observers = std::mem::take(&mut *lock(&self.observers));
        for observer in observers {
            observer(true);
        }
    }

    fn wants_json(&self) -> bool {
        if let Some(requested_with) = self.request_header("x-requested-with") {
            if requested_with.eq_ignore_ascii_case("xmlhttprequest") {
                return true;
            }
        }
        if let Some(auth) = self.request_header("authorization") {
            if auth.contains("Bearer") || auth.contains("Token") {
                return true;
            }
        }
        false
    }
}

fn set_header_in(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    for (n, v) in headers.iter_mut() {
        if n.eq_ignore_ascii_case(name) {
            *v = value.to_string();
            return;
        }
    }
    headers.push((name.to_string(), value.to_string()));
}

fn serialize_head(
    version: &str,
    status: u16,
    reason: Option<&str>,
    headers: &[(String, String)],
) -> String {
    let mut head = format!(
        "HTTP/{} {} {}\r\n",
        version,
        status,
        reason.unwrap_or_else(|| reason_phrase(status))
    );
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Compress a buffer with the named HTTP content coding
pub(crate) fn compress(encoding: &str, data: &[u8]) -> io::Result<Vec<u8>> {
    match encoding {
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported content coding: {}", other),
        )),
    }
}
