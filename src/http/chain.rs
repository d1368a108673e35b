//! Controller chain execution
//!
//! Each matched route carries an ordered chain of controllers. Controllers
//! run strictly in declaration order: the driver does not start controller
//! `n + 1` until `n` completions have been counted on the chain barrier.
//! A completion is a `Signal::ret()` call, which may come from any thread.
//!
//! Every controller invocation runs inside its own fault domain: a panic is
//! logged, turned into a generic 500 response and stops that one request's
//! pipeline without touching the worker or sibling requests.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::http::router::Route;
use crate::http::signal::Signal;

/// Completion callback handed to a callback-style operation
pub type OpCallback = Box<dyn FnOnce(Option<Value>, Option<Value>) + Send>;

/// A callback-style operation yielded by a coroutine. Receives a completion
/// callback and must arrange for it to be called exactly once with
/// `(error, result)`.
pub type AsyncOp = Box<dyn FnOnce(OpCallback) + Send>;

/// Value fed back into a coroutine on resume
pub enum Resume {
    /// First resume, nothing yielded yet
    Start,
    /// Outcome of a single yielded operation
    Single {
        error: Option<Value>,
        value: Option<Value>,
    },
    /// Settled outcomes of a fan-out batch, positionally aligned with the
    /// yielded operations
    Batch {
        errors: Vec<Option<Value>>,
        results: Vec<Option<Value>>,
    },
    /// A yielded plain value, passed straight back
    Value(Value),
}

/// What a coroutine yields at each step
pub enum Yielded {
    /// Run one operation, resume with its outcome
    Op(AsyncOp),
    /// Run all operations concurrently, resume once every one has settled
    Batch(Vec<AsyncOp>),
    /// Resume immediately with this value
    Value(Value),
}

/// One coroutine step
pub enum Step {
    Yield(Yielded),
    Done,
}

/// A resumable controller. `resume` is called with the outcome of whatever
/// the previous step yielded; returning [`Step::Done`] completes the
/// controller (the driver counts the completion).
pub trait Coroutine: Send {
    fn resume(&mut self, signal: &Arc<Signal>, input: Resume) -> Step;
}

/// A chain entry
pub enum Controller {
    /// Invoked once with the request signal; must eventually call
    /// `Signal::ret()`, from any thread
    Plain(Arc<dyn Fn(&Arc<Signal>) + Send + Sync>),
    /// A factory producing a fresh coroutine per request
    Coroutine(Arc<dyn Fn() -> Box<dyn Coroutine> + Send + Sync>),
    /// Skipped, counted as already complete
    Disabled,
}

impl Controller {
    pub fn plain(f: impl Fn(&Arc<Signal>) + Send + Sync + 'static) -> Self {
        Controller::Plain(Arc::new(f))
    }

    pub fn coroutine(factory: impl Fn() -> Box<dyn Coroutine> + Send + Sync + 'static) -> Self {
        Controller::Coroutine(Arc::new(factory))
    }
}

impl Clone for Controller {
    fn clone(&self) -> Self {
        match self {
            Controller::Plain(f) => Controller::Plain(f.clone()),
            Controller::Coroutine(f) => Controller::Coroutine(f.clone()),
            Controller::Disabled => Controller::Disabled,
        }
    }
}

/// Completion counter scoped to one chain on one signal
pub struct ChainBarrier {
    count: Mutex<usize>,
    cv: Condvar,
}

impl ChainBarrier {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Count one completion
    pub fn arrive(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        self.cv.notify_all();
    }

    /// Block until `n` completions have been counted. Returns false if the
    /// abort predicate became true first.
    pub fn wait_until(&self, n: usize, aborted: impl Fn() -> bool) -> bool {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *count >= n {
                return true;
            }
            if aborted() {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(count, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            count = guard;
        }
    }
}

impl Default for ChainBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a route's controller chain to completion on the current thread
pub fn run_chain(route: &Arc<Route>, signal: &Arc<Signal>) {
    if route.chain.is_empty() {
        return;
    }
    let barrier = Arc::new(ChainBarrier::new());
    signal.arm_chain(barrier.clone());
    for (index, controller) in route.chain.iter().enumerate() {
        if signal.stopped() {
            break;
        }
        match controller {
            Controller::Disabled => barrier.arrive(),
            Controller::Plain(f) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (**f)(signal))) {
                    fault(route, index, payload.as_ref(), signal);
                    barrier.arrive();
                }
            }
            Controller::Coroutine(factory) => match catch_unwind(AssertUnwindSafe(|| (**factory)())) {
                Ok(coroutine) => drive(coroutine, route, index, signal, &barrier),
                Err(payload) => {
                    fault(route, index, payload.as_ref(), signal);
                    barrier.arrive();
                }
            },
        }
        if !barrier.wait_until(index + 1, || signal.stopped()) {
            break;
        }
    }
    signal.disarm_chain();
}

/// Step a coroutine until it finishes, running yielded operations between
/// resumes. Counts the completion itself when the coroutine is done.
fn drive(
    mut coroutine: Box<dyn Coroutine>,
    route: &Arc<Route>,
    index: usize,
    signal: &Arc<Signal>,
    barrier: &ChainBarrier,
) {
    let mut input = Resume::Start;
    loop {
        let step = {
            let coroutine = &mut coroutine;
            let fed = input;
            catch_unwind(AssertUnwindSafe(move || coroutine.resume(signal, fed)))
        };
        match step {
            Err(payload) => {
                fault(route, index, payload.as_ref(), signal);
                barrier.arrive();
                return;
            }
            Ok(Step::Done) => {
                signal.ret();
                return;
            }
            Ok(Step::Yield(Yielded::Value(value))) => {
                input = Resume::Value(value);
            }
            Ok(Step::Yield(Yielded::Op(op))) => match run_op(op) {
                Ok((error, value)) => input = Resume::Single { error, value },
                Err(payload) => {
                    fault(route, index, payload.as_ref(), signal);
                    barrier.arrive();
                    return;
                }
            },
            Ok(Step::Yield(Yielded::Batch(ops))) => {
                input = run_batch(ops);
            }
        }
    }
}

/// Run one callback-style operation and wait for its outcome
fn run_op(op: AsyncOp) -> thread::Result<(Option<Value>, Option<Value>)> {
    let (tx, rx) = mpsc::channel();
    let callback: OpCallback = Box::new(move |error, value| {
        let _ = tx.send((error, value));
    });
    catch_unwind(AssertUnwindSafe(move || op(callback)))?;
    Ok(rx.recv().unwrap_or((
        Some(Value::String("operation dropped its callback".to_string())),
        None,
    )))
}

/// Run a batch of operations concurrently and wait for every one to settle.
/// Outcomes are positional: slot `i` of both vectors belongs to operation
/// `i` no matter which finished first.
fn run_batch(ops: Vec<AsyncOp>) -> Resume {
    let total = ops.len();
    let (tx, rx) = mpsc::channel::<(usize, Option<Value>, Option<Value>)>();
    for (slot, op) in ops.into_iter().enumerate() {
        let done = tx.clone();
        let fallback = tx.clone();
        thread::spawn(move || {
            let callback: OpCallback = Box::new(move |error, value| {
                let _ = done.send((slot, error, value));
            });
            if catch_unwind(AssertUnwindSafe(move || op(callback))).is_err() {
                let _ = fallback.send((
                    slot,
                    Some(Value::String("operation panicked".to_string())),
                    None,
                ));
            }
        });
    }
    drop(tx);

    let mut errors: Vec<Option<Value>> = vec![None; total];
    let mut results: Vec<Option<Value>> = vec![None; total];
    let mut settled = vec![false; total];
    let mut remaining = total;
    while remaining > 0 {
        match rx.recv() {
            Ok((slot, error, value)) => {
                if !settled[slot] {
                    settled[slot] = true;
                    remaining -= 1;
                    errors[slot] = error;
                    results[slot] = value;
                }
            }
            // Every sender gone without reporting: leave those slots unset.
            Err(_) => break,
        }
    }
    Resume::Batch { errors, results }
}

/// Attribute a panic to its controller, answer 500 and stop the pipeline
fn fault(route: &Arc<Route>, index: usize, payload: &(dyn Any + Send), signal: &Arc<Signal>) {
    let message = panic_message(payload);
    tracing::error!(
        route = %route.pattern.raw(),
        controller = index,
        %message,
        "controller panicked"
    );
    signal.fail("500 Server Error");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "controller panicked".to_string()
    }
}
