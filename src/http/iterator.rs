//! Phase driver
//!
//! Header, footer and missing routes are plain ordered lists. Each entry's
//! chain runs to completion before the next starts; a stopped signal ends
//! the walk early.

use std::sync::Arc;

use crate::http::chain;
use crate::http::router::Route;
use crate::http::signal::Signal;

/// Run every route of a phase in order until the signal stops
pub fn run_phase(routes: &[Arc<Route>], signal: &Arc<Signal>) {
    for route in routes {
        if signal.stopped() {
            return;
        }
        chain::run_chain(route, signal);
    }
}
