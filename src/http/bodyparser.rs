//! Request body decoding
//!
//! Runs after the header phase for matched routes only. The content type
//! picks the decoder; a body that fails to parse is swallowed and the
//! signal's body stays empty. Multipart decoding is delegated to a
//! pluggable parser that reports fields and files as events.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::http::handler::App;
use crate::http::signal::{Body, Signal, UploadedFile};

/// One decoded multipart part
pub enum MultipartEvent {
    Field {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: Option<String>,
        content_type: Option<String>,
        data: Vec<u8>,
    },
}

/// Pluggable multipart decoder. Implementations walk the body and emit one
/// event per part; the core never looks at multipart bytes itself.
pub trait MultipartParser: Send + Sync {
    fn parse(
        &self,
        content_type: &str,
        body: &[u8],
        sink: &mut dyn FnMut(MultipartEvent),
    ) -> Result<()>;
}

/// Decode the buffered request body onto the signal
pub fn parse(app: &Arc<App>, signal: &Arc<Signal>) {
    let content_type = signal.request_header("content-type").map(|s| s.to_string());
    let transfer_encoding = signal.request_header("transfer-encoding");
    if content_type.is_none() && transfer_encoding.is_none() {
        return;
    }
    let content_type = content_type.unwrap_or_default();
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if media_type == "application/x-www-form-urlencoded" {
        let form: HashMap<String, String> = url::form_urlencoded::parse(signal.raw_body())
            .into_owned()
            .collect();
        signal.set_body(Body::Form(form));
    } else if media_type == "application/json" {
        match serde_json::from_slice(signal.raw_body()) {
            Ok(value) => signal.set_body(Body::Json(value)),
            // Unparseable JSON is swallowed, the body stays empty.
            Err(e) => tracing::debug!(error = %e, "discarding malformed json body"),
        }
    } else if media_type == "multipart/form-data" {
        let Some(parser) = app.multipart() else {
            tracing::debug!("multipart body with no parser configured");
            return;
        };
        let mut fields = HashMap::new();
        let outcome = parser.parse(&content_type, signal.raw_body(), &mut |event| match event {
            MultipartEvent::Field { name, value } => {
                fields.insert(name, value);
            }
            MultipartEvent::File {
                name,
                filename,
                content_type,
                data,
            } => {
                signal.add_file(UploadedFile {
                    name,
                    filename,
                    content_type,
                    data,
                });
            }
        });
        match outcome {
            Ok(()) => signal.set_body(Body::Multipart(fields)),
            Err(e) => tracing::debug!(error = %e, "discarding malformed multipart body"),
        }
    } else if media_type.ends_with("/xml") || media_type.ends_with("+xml") {
        signal.set_body(Body::Xml(
            String::from_utf8_lossy(signal.raw_body()).to_string(),
        ));
    } else {
        signal.set_body(Body::Raw(signal.raw_body().to_vec()));
    }
}
