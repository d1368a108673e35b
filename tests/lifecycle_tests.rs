//! Request lifecycle tests against the in-process engine
//!
//! These drive `handler::handle` directly over socketpairs, without a
//! supervisor or worker process in between.

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use gul::bundle::MemStore;
use gul::http::handler::{handle, AppBuilder};
use gul::http::{App, Controller, Coroutine, RequestMeta, Resume, Signal, Step, Yielded};

fn serve(app: &Arc<App>, meta: RequestMeta) -> (bool, String) {
    let (conn, mut peer) = UnixStream::pair().unwrap();
    let handled = handle(app, meta, Box::new(conn));
    let mut buf = Vec::new();
    peer.read_to_end(&mut buf).unwrap();
    (handled, String::from_utf8_lossy(&buf).to_string())
}

#[test]
fn param_route_greets_by_name() {
    let mut builder = AppBuilder::new(Arc::new(MemStore::new("greeter")));
    builder.router().get(
        "/hello/:name",
        vec![Controller::plain(|signal: &Arc<Signal>| {
            let name = signal.param("name").unwrap_or_default();
            signal.end(format!("hi {}", name));
            signal.ret();
        })],
    );
    let app = builder.build();

    let (handled, response) = serve(&app, RequestMeta::new("GET", "/hello/world"));
    assert!(handled);
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("hi world"));
}

#[test]
fn empty_body_negotiated_to_204() {
    let mut builder = AppBuilder::new(Arc::new(MemStore::new("empty")));
    builder.router().get(
        "/nothing",
        vec![Controller::plain(|signal: &Arc<Signal>| {
            signal.end("");
            signal.ret();
        })],
    );
    let app = builder.build();

    let meta = RequestMeta::new("GET", "/nothing").with_header("Accept-Encoding", "gzip, deflate");
    let (handled, response) = serve(&app, meta);
    assert!(handled);
    assert!(response.starts_with("HTTP/1.1 204"));
    assert!(response.contains("Content-Length: 0"));
    assert!(!response.contains("Content-Encoding"));
}

#[test]
fn second_end_is_a_no_op() {
    let mut builder = AppBuilder::new(Arc::new(MemStore::new("once")));
    builder.router().get(
        "/once",
        vec![
            Controller::plain(|signal: &Arc<Signal>| {
                signal.end("the real response");
                signal.ret();
            }),
            Controller::plain(|signal: &Arc<Signal>| {
                signal.end("the impostor");
                signal.ret();
            }),
        ],
    );
    let app = builder.build();

    let (_, response) = serve(&app, RequestMeta::new("GET", "/once"));
    assert_eq!(response.matches("HTTP/1.1").count(), 1);
    assert!(response.contains("the real response"));
    assert!(!response.contains("the impostor"));
}

#[test]
fn chain_ordering_holds_across_threads() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut builder = AppBuilder::new(Arc::new(MemStore::new("ordered")));
    let slow = {
        let order = order.clone();
        Controller::plain(move |signal: &Arc<Signal>| {
            // Completes from another thread after a delay; the next
            // controller must still wait for it.
            let order = order.clone();
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                order.lock().unwrap().push("slow");
                signal.ret();
            });
        })
    };
    let fast = {
        let order = order.clone();
        Controller::plain(move |signal: &Arc<Signal>| {
            order.lock().unwrap().push("fast");
            signal.end("done");
            signal.ret();
        })
    };
    builder.router().get("/ordered", vec![slow, fast]);
    let app = builder.build();

    let (handled, _) = serve(&app, RequestMeta::new("GET", "/ordered"));
    assert!(handled);
    assert_eq!(*order.lock().unwrap(), vec!["slow", "fast"]);
}

#[test]
fn panicking_controller_isolated_from_concurrent_request() {
    let mut builder = AppBuilder::new(Arc::new(MemStore::new("isolated")));
    builder.router().get(
        "/boom",
        vec![Controller::plain(|_signal: &Arc<Signal>| {
            panic!("controller bug")
        })],
    );
    builder.router().get(
        "/calm",
        vec![Controller::plain(|signal: &Arc<Signal>| {
            thread::sleep(Duration::from_millis(30));
            signal.end("still here");
            signal.ret();
        })],
    );
    let app = builder.build();

    let calm_app = app.clone();
    let calm = thread::spawn(move || serve(&calm_app, RequestMeta::new("GET", "/calm")));
    let (boom_handled, boom_response) = serve(&app, RequestMeta::new("GET", "/boom"));
    let (calm_handled, calm_response) = calm.join().unwrap();

    assert!(boom_handled);
    assert!(boom_response.starts_with("HTTP/1.1 500"));
    assert!(boom_response.contains("500 Server Error"));
    // The panic's text never reaches the client.
    assert!(!boom_response.contains("controller bug"));

    assert!(calm_handled);
    assert!(calm_response.starts_with("HTTP/1.1 200"));
    assert!(calm_response.ends_with("still here"));
}

#[test]
fn faulted_chain_skips_later_controllers() {
    let ran_after = Arc::new(AtomicUsize::new(0));
    let mut builder = AppBuilder::new(Arc::new(MemStore::new("faulted")));
    let after = {
        let ran_after = ran_after.clone();
        Controller::plain(move |signal: &Arc<Signal>| {
            ran_after.fetch_add(1, Ordering::SeqCst);
            signal.ret();
        })
    };
    builder.router().get(
        "/fault",
        vec![
            Controller::plain(|_signal: &Arc<Signal>| panic!("early")),
            after,
        ],
    );
    let app = builder.build();

    let (_, response) = serve(&app, RequestMeta::new("GET", "/fault"));
    assert!(response.starts_with("HTTP/1.1 500"));
    assert_eq!(ran_after.load(Ordering::SeqCst), 0);
}

// Coroutine controller that fans out two operations and records the
// settled outcome vectors.
struct FanOut {
    step: usize,
    seen: Arc<Mutex<Option<(Vec<Option<Value>>, Vec<Option<Value>>)>>>,
}

impl Coroutine for FanOut {
    fn resume(&mut self, signal: &Arc<Signal>, input: Resume) -> Step {
        self.step += 1;
        match self.step {
            1 => {
                let slow_ok: gul::http::AsyncOp = Box::new(|cb| {
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(40));
                        cb(None, Some(Value::from("slow result")));
                    });
                });
                let fast_err: gul::http::AsyncOp =
                    Box::new(|cb| cb(Some(Value::from("fast failure")), None));
                Step::Yield(Yielded::Batch(vec![slow_ok, fast_err]))
            }
            _ => {
                if let Resume::Batch { errors, results } = input {
                    *self.seen.lock().unwrap() = Some((errors, results));
                }
                signal.end("fanned out");
                Step::Done
            }
        }
    }
}

#[test]
fn fan_out_settles_positionally() {
    let seen = Arc::new(Mutex::new(None));
    let mut builder = AppBuilder::new(Arc::new(MemStore::new("fanout")));
    let factory_seen = seen.clone();
    builder.router().get(
        "/fan",
        vec![Controller::coroutine(move || {
            Box::new(FanOut {
                step: 0,
                seen: factory_seen.clone(),
            })
        })],
    );
    let app = builder.build();

    let (handled, response) = serve(&app, RequestMeta::new("GET", "/fan"));
    assert!(handled);
    assert!(response.ends_with("fanned out"));

    let seen = seen.lock().unwrap();
    let (errors, results) = seen.as_ref().expect("batch outcome recorded");
    // Slot 0 settled last but keeps its position.
    assert!(errors[0].is_none());
    assert_eq!(results[0], Some(Value::from("slow result")));
    assert_eq!(errors[1], Some(Value::from("fast failure")));
    assert!(results[1].is_none());
}

// Coroutine that yields a single operation and then a plain value.
struct SingleOp {
    step: usize,
}

impl Coroutine for SingleOp {
    fn resume(&mut self, signal: &Arc<Signal>, input: Resume) -> Step {
        self.step += 1;
        match self.step {
            1 => Step::Yield(Yielded::Op(Box::new(|cb| {
                cb(None, Some(Value::from(21)))
            }))),
            2 => {
                let doubled = match input {
                    Resume::Single {
                        value: Some(Value::Number(n)),
                        ..
                    } => n.as_i64().unwrap_or(0) * 2,
                    _ => 0,
                };
                Step::Yield(Yielded::Value(Value::from(doubled)))
            }
            _ => {
                if let Resume::Value(value) = input {
                    signal.end(format!("answer {}", value));
                } else {
                    signal.end("lost");
                }
                Step::Done
            }
        }
    }
}

#[test]
fn coroutine_single_op_and_value_passthrough() {
    let mut builder = AppBuilder::new(Arc::new(MemStore::new("coroutine")));
    builder.router().get(
        "/answer",
        vec![Controller::coroutine(|| Box::new(SingleOp { step: 0 }))],
    );
    let app = builder.build();

    let (handled, response) = serve(&app, RequestMeta::new("GET", "/answer"));
    assert!(handled);
    assert!(response.ends_with("answer 42"));
}

#[test]
fn unmatched_path_reports_unhandled() {
    let app = AppBuilder::new(Arc::new(MemStore::new("bare"))).build();
    let (conn, _peer) = UnixStream::pair().unwrap();
    let handled = handle(&app, RequestMeta::new("GET", "/missing"), Box::new(conn));
    assert!(!handled);
}

#[test]
fn missing_phase_serves_custom_404() {
    let mut builder = AppBuilder::new(Arc::new(MemStore::new("custom404")));
    builder.router().missing(vec![Controller::plain(
        |signal: &Arc<Signal>| {
            signal.end("not here, sorry");
            signal.ret();
        },
    )]);
    let app = builder.build();

    let (handled, response) = serve(&app, RequestMeta::new("GET", "/missing"));
    assert!(handled);
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.ends_with("not here, sorry"));
}

#[test]
fn static_asset_served_from_footer_phase() {
    let store = Arc::new(MemStore::new("site").with_file("assets/app.js", &b"console.log(1)"[..]));
    let mut builder = AppBuilder::new(store.clone());
    builder
        .router()
        .footer(vec![gul::http::middlewares::static_files::controller(
            store,
        )]);
    let app = builder.build();

    let (handled, response) = serve(&app, RequestMeta::new("GET", "/app.js"));
    assert!(handled);
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("Content-Type: application/javascript"));
    assert!(response.ends_with("console.log(1)"));
}
