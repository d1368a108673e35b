//! Worker process main loop
//!
//! Runs in the forked child and never returns. The first `Init` frame
//! builds the application (static middleware, then the embedder's setup
//! hook); every `DeliverConnection` frame is followed by a connection fd
//! and spawns an independent request thread. Losing the control channel
//! means the supervisor is gone, so the worker exits.

use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process;
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::Value;

use crate::bundle::{PackageStore, ServeOptions};
use crate::daemon::protocol::{self, ControlMessage, MemoryUsage};
use crate::error::{GulError, Result};
use crate::http::handler::{self, App, AppBuilder, AppSetup};
use crate::http::middlewares::static_files;
use crate::sync::lock;

/// Worker entry point; takes the child end of the control socketpair
pub fn run(
    channel: UnixStream,
    store: Arc<dyn PackageStore>,
    setup: AppSetup,
    options: ServeOptions,
) -> ! {
    let mut reader = match channel.try_clone() {
        Ok(reader) => reader,
        Err(_) => process::exit(1),
    };
    let writer = Arc::new(Mutex::new(channel));
    let mut app: Option<Arc<App>> = None;

    loop {
        let (message, id) = match protocol::read_message(&mut reader) {
            Ok(frame) => frame,
            // Supervisor went away; nothing left to serve.
            Err(_) => process::exit(0),
        };
        match message {
            ControlMessage::Init { context } => {
                let reply = match serde_json::from_str::<Value>(&context) {
                    Ok(context) => match build_app(&store, &setup, &options, &context) {
                        Ok(built) => {
                            let info = built.info();
                            app = Some(built);
                            ControlMessage::Package(info)
                        }
                        Err(e) => ControlMessage::Err(e.to_string()),
                    },
                    Err(e) => ControlMessage::Err(format!("invalid init context: {}", e)),
                };
                reply_to(&writer, &id, reply);
            }
            ControlMessage::Memory => {
                reply_to(
                    &writer,
                    &id,
                    ControlMessage::MemoryReport(MemoryUsage::read_self()),
                );
            }
            ControlMessage::Shutdown => process::exit(0),
            ControlMessage::DeliverConnection { meta } => {
                let fd = match protocol::recv_fd(&reader) {
                    Ok(fd) => fd,
                    Err(e) => {
                        reply_to(
                            &writer,
                            &id,
                            ControlMessage::Err(format!("connection fd missing: {}", e)),
                        );
                        continue;
                    }
                };
                let conn = unsafe { UnixStream::from_raw_fd(fd) };
                match &app {
                    None => {
                        reply_to(
                            &writer,
                            &id,
                            ControlMessage::Err("worker not initialized".to_string()),
                        );
                    }
                    Some(app) => {
                        let app = app.clone();
                        let writer = writer.clone();
                        thread::spawn(move || {
                            let handled = handler::handle(&app, meta, Box::new(conn));
                            reply_to(&writer, &id, ControlMessage::Handled(handled));
                        });
                    }
                }
            }
            other => {
                tracing::warn!(?other, "unexpected control message in worker");
                reply_to(
                    &writer,
                    &id,
                    ControlMessage::Err("unexpected message".to_string()),
                );
            }
        }
    }
}

fn build_app(
    store: &Arc<dyn PackageStore>,
    setup: &AppSetup,
    options: &ServeOptions,
    context: &Value,
) -> Result<Arc<App>> {
    let build = || {
        let mut builder = AppBuilder::new(store.clone()).options(options.clone());
        builder
            .router()
            .footer(vec![static_files::controller(store.clone())]);
        (**setup)(&mut builder, context);
        builder.build()
    };
    catch_unwind(AssertUnwindSafe(build))
        .map_err(|_| GulError::Worker("application setup panicked".to_string()))
}

fn reply_to(writer: &Arc<Mutex<UnixStream>>, id: &str, message: ControlMessage) {
    let mut writer = lock(writer);
    if let Err(e) = protocol::write_message(&mut *writer, &message, id) {
        tracing::warn!(error = %e, "control reply failed");
    }
}
