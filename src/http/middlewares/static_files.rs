//! Static asset footer middleware
//!
//! Serves bundle files under `assets/` for any request nothing else
//! responded to. Honors `If-Modified-Since` against the bundle's
//! modification time and keeps a per-encoding cache of compressed bytes so
//! each asset is compressed at most once per encoding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::bundle::PackageStore;
use crate::http::chain::Controller;
use crate::http::signal::{self, Payload, Signal};
use crate::sync::lock;

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Build the footer controller for a bundle's assets
pub fn controller(store: Arc<dyn PackageStore>) -> Controller {
    let cache: Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>> = Arc::new(Mutex::new(HashMap::new()));
    Controller::plain(move |signal: &Arc<Signal>| {
        serve(&store, &cache, signal);
        signal.ret();
    })
}

fn serve(
    store: &Arc<dyn PackageStore>,
    cache: &Mutex<HashMap<String, Arc<Vec<u8>>>>,
    signal: &Arc<Signal>,
) {
    if signal.responded() || signal.stopped() {
        return;
    }
    let name = format!("assets{}", signal.path());
    if !store.exists(&name) {
        return;
    }

    let modified: DateTime<Utc> = DateTime::from(store.modified());
    if let Some(since) = signal.request_header("if-modified-since") {
        if let Ok(since) = DateTime::parse_from_rfc2822(since) {
            if modified.timestamp() <= since.timestamp() {
                signal.status(304);
                signal.end(Payload::Empty);
                return;
            }
        }
    }

    let Some(data) = store.get_file(&name) else {
        return;
    };

    signal.set_header("Content-Type", mime_for(signal.path()));
    signal.set_header("Last-Modified", &modified.format(HTTP_DATE).to_string());
    signal.set_header(
        "Expires",
        &(Utc::now() + Duration::days(7)).format(HTTP_DATE).to_string(),
    );
    signal.set_header("Cache-Control", "public");

    let accept = signal.request_header("accept-encoding").map(str::to_string);
    if let (Some(accept), false) = (accept, data.is_empty()) {
        let encoding = if accept
            .split(',')
            .any(|e| e.trim().eq_ignore_ascii_case("gzip"))
        {
            "gzip"
        } else {
            "deflate"
        };
        let key = format!("{} {}", encoding, name);
        let cached = lock(cache).get(&key).cloned();
        let bytes = match cached {
            Some(bytes) => Some(bytes),
            None => match signal::compress(encoding, &data) {
                Ok(encoded) => {
                    let encoded = Arc::new(encoded);
                    lock(cache).insert(key, encoded.clone());
                    Some(encoded)
                }
                Err(e) => {
                    tracing::warn!(asset = %name, error = %e, "asset compression failed");
                    None
                }
            },
        };
        if let Some(bytes) = bytes {
            signal.set_header("Content-Encoding", encoding);
            signal.set_header("Vary", "Accept-Encoding");
            signal.end(Payload::Bytes(bytes.as_ref().clone()));
            return;
        }
    }
    signal.end(Payload::Bytes(data));
}

fn mime_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::MemStore;
    use crate::http::handler::{handle, AppBuilder};
    use crate::http::RequestMeta;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration as StdDuration, SystemTime};

    fn static_app(modified: SystemTime) -> Arc<crate::http::handler::App> {
        let store = Arc::new(
            MemStore::new("assets-demo")
                .with_file("assets/site.css", &b"body { color: red }"[..])
                .with_file("assets/empty.txt", &b""[..])
                .with_modified(modified),
        );
        let mut builder = AppBuilder::new(store.clone());
        builder.router().footer(vec![controller(store)]);
        builder.build()
    }

    fn serve_request(app: &Arc<crate::http::handler::App>, meta: RequestMeta) -> (bool, String) {
        let (conn, mut peer) = UnixStream::pair().unwrap();
        let handled = handle(app, meta, Box::new(conn));
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).unwrap();
        (handled, String::from_utf8_lossy(&buf).to_string())
    }

    #[test]
    fn test_existing_asset_served_with_caching_headers() {
        let app = static_app(SystemTime::now());
        let (handled, response) = serve_request(&app, RequestMeta::new("GET", "/site.css"));
        assert!(handled);
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("Content-Type: text/css"));
        assert!(response.contains("Last-Modified:"));
        assert!(response.contains("Cache-Control: public"));
        assert!(response.contains("body { color: red }"));
    }

    #[test]
    fn test_if_modified_since_fresh_returns_304() {
        let modified = SystemTime::now() - StdDuration::from_secs(3600);
        let app = static_app(modified);
        let since: DateTime<Utc> = DateTime::from(SystemTime::now());
        let meta = RequestMeta::new("GET", "/site.css")
            .with_header("If-Modified-Since", &since.to_rfc2822());
        let (handled, response) = serve_request(&app, meta);
        assert!(handled);
        assert!(response.starts_with("HTTP/1.1 304"));
        assert!(response.contains("Content-Length: 0"));
    }

    #[test]
    fn test_if_modified_since_stale_serves_body() {
        let app = static_app(SystemTime::now());
        let since: DateTime<Utc> = DateTime::from(SystemTime::now() - StdDuration::from_secs(3600));
        let meta = RequestMeta::new("GET", "/site.css")
            .with_header("If-Modified-Since", &since.to_rfc2822());
        let (_, response) = serve_request(&app, meta);
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("body { color: red }"));
    }

    #[test]
    fn test_compressed_asset_cached_per_encoding() {
        let app = static_app(SystemTime::now());
        let meta = RequestMeta::new("GET", "/site.css").with_header("Accept-Encoding", "gzip");
        let (_, first) = serve_request(&app, meta.clone());
        assert!(first.contains("Content-Encoding: gzip"));
        assert!(first.contains("Vary: Accept-Encoding"));

        // Second hit comes out of the cache with identical headers.
        let (_, second) = serve_request(&app, meta);
        assert!(second.contains("Content-Encoding: gzip"));
    }

    #[test]
    fn test_empty_asset_yields_204() {
        let app = static_app(SystemTime::now());
        let meta = RequestMeta::new("GET", "/empty.txt").with_header("Accept-Encoding", "gzip");
        let (handled, response) = serve_request(&app, meta);
        assert!(handled);
        assert!(response.starts_with("HTTP/1.1 204"));
        assert!(!response.contains("Content-Encoding"));
    }

    #[test]
    fn test_unknown_asset_left_for_next_phase() {
        let app = static_app(SystemTime::now());
        let (conn, _peer) = UnixStream::pair().unwrap();
        let handled = handle(&app, RequestMeta::new("GET", "/absent.css"), Box::new(conn));
        assert!(!handled);
    }
}
