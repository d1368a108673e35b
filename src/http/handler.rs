//! Request lifecycle orchestration
//!
//! `handle` drives one delivered connection through the full pipeline:
//! vhost gate, route resolution, header phase, body parsing, the route
//! chain, footer phase and finally the missing phase when nothing
//! responded. The boolean it returns is what the worker reports back to
//! the supervisor.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::bundle::{PackageInfo, PackageStore, ServeOptions};
use crate::conn::Conn;
use crate::http::bodyparser::{self, MultipartParser};
use crate::http::router::{RouteTable, RouterBuilder};
use crate::http::signal::Signal;
use crate::http::{chain, iterator, RequestMeta};
use crate::view::ViewRenderer;

/// Application setup hook run in the worker process at init time. Receives
/// the builder plus the context value the embedder passed to `start`.
pub type AppSetup = Arc<dyn Fn(&mut AppBuilder, &Value) + Send + Sync>;

/// A built application: frozen routes plus its collaborators
pub struct App {
    table: Arc<RouteTable>,
    store: Arc<dyn PackageStore>,
    renderer: Option<Arc<dyn ViewRenderer>>,
    multipart: Option<Arc<dyn MultipartParser>>,
    default_headers: Vec<(String, String)>,
    vhost: Vec<String>,
    info: PackageInfo,
}

impl App {
    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    pub fn store(&self) -> &Arc<dyn PackageStore> {
        &self.store
    }

    pub fn multipart(&self) -> Option<Arc<dyn MultipartParser>> {
        self.multipart.clone()
    }

    /// Name, version, dependencies and route summary
    pub fn info(&self) -> PackageInfo {
        self.info.clone()
    }
}

/// Single-threaded application assembly
pub struct AppBuilder {
    router: RouterBuilder,
    store: Arc<dyn PackageStore>,
    renderer: Option<Arc<dyn ViewRenderer>>,
    multipart: Option<Arc<dyn MultipartParser>>,
    options: ServeOptions,
}

impl AppBuilder {
    /// Start a builder for a bundle. Serve options default to the ones in
    /// the bundle manifest.
    pub fn new(store: Arc<dyn PackageStore>) -> Self {
        let options = store.manifest().serve;
        Self {
            router: RouterBuilder::new(),
            store,
            renderer: None,
            multipart: None,
            options,
        }
    }

    /// Override the manifest serve options
    pub fn options(mut self, options: ServeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn router(&mut self) -> &mut RouterBuilder {
        &mut self.router
    }

    pub fn renderer(&mut self, renderer: Arc<dyn ViewRenderer>) {
        self.renderer = Some(renderer);
    }

    pub fn multipart(&mut self, parser: Arc<dyn MultipartParser>) {
        self.multipart = Some(parser);
    }

    pub fn build(self) -> Arc<App> {
        let manifest = self.store.manifest();
        let server_name = self
            .options
            .server_name
            .clone()
            .unwrap_or_else(|| "gul".to_string());
        let default_headers = vec![
            ("Server".to_string(), server_name),
            ("X-Powered-By".to_string(), manifest.name.clone()),
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("Connection".to_string(), "close".to_string()),
        ];
        let table = self.router.freeze();
        let info = PackageInfo {
            name: manifest.name,
            version: manifest.version,
            routes: table.summary().to_vec(),
            dependencies: manifest.dependencies,
        };
        Arc::new(App {
            table,
            store: self.store,
            renderer: self.renderer,
            multipart: self.multipart,
            default_headers,
            vhost: self.options.vhost,
            info,
        })
    }
}

/// Drive one request to completion. Returns whether a response was written.
pub fn handle(app: &Arc<App>, meta: RequestMeta, conn: Box<dyn Conn>) -> bool {
    let signal = Signal::new(&meta, conn, &app.default_headers, app.renderer.clone());
    tracing::info!(method = %meta.method, path = %meta.path, host = %meta.hostname, "request");

    if catch_unwind(AssertUnwindSafe(|| run_pipeline(app, &meta, &signal))).is_err() {
        tracing::error!(path = %meta.path, "request pipeline panicked");
        signal.fail("500 Server Error");
    }
    signal.responded()
}

fn run_pipeline(app: &Arc<App>, meta: &RequestMeta, signal: &Arc<Signal>) {
    if !app.vhost.is_empty() {
        match app
            .vhost
            .iter()
            .find_map(|pattern| match_host(pattern, &meta.hostname))
        {
            Some(captures) => signal.merge_params(captures),
            None => {
                signal.status(404);
                signal.end_last(format!("{} Not found", meta.hostname));
                return;
            }
        }
    }

    if let Some((route, captures)) = app.table.resolve(&meta.method, &meta.path) {
        signal.merge_params(captures);
        signal.set_route(route);
    }

    iterator::run_phase(app.table.header(), signal);

    if signal.route().is_some() && !signal.stopped() {
        bodyparser::parse(app, signal);
    }

    if let Some(route) = signal.route() {
        if !signal.stopped() {
            chain::run_chain(&route, signal);
        }
    }

    if !signal.stopped() {
        iterator::run_phase(app.table.footer(), signal);
    }

    if !signal.responded() && !signal.stopped() && !app.table.missing().is_empty() {
        signal.status(404);
        iterator::run_phase(app.table.missing(), signal);
    }
}

/// Match a dot-separated vhost pattern against a host name. `:name`
/// segments capture, `*` matches any one segment.
fn match_host(pattern: &str, host: &str) -> Option<Vec<(String, String)>> {
    let host = host.split(':').next().unwrap_or(host);
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let host_parts: Vec<&str> = host.split('.').collect();
    if pattern_parts.len() != host_parts.len() {
        return None;
    }
    let mut captures = Vec::new();
    for (p, h) in pattern_parts.iter().zip(&host_parts) {
        if let Some(name) = p.strip_prefix(':') {
            captures.push((name.to_string(), (*h).to_string()));
        } else if *p != "*" && !p.eq_ignore_ascii_case(h) {
            return None;
        }
    }
    Some(captures)
}

/// Fallback body a front end writes when nothing handled the request
pub fn write_not_found(conn: &mut dyn std::io::Write) -> std::io::Result<()> {
    let body = b"404 Not found";
    let head = format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    conn.write_all(head.as_bytes())?;
    conn.write_all(body)?;
    conn.flush()
}
