//! Supervisor/worker machinery
//!
//! The supervisor forks one isolated worker per started application and
//! talks to it over a socketpair control channel. Delivered connections
//! travel as file descriptors; the rendezvous broker wires the client
//! socket to the worker-bound one with a pair of pump threads.

pub mod control;
pub mod handoff;
pub mod protocol;
pub mod supervisor;
pub mod worker;

pub use control::ControlChannel;
pub use handoff::HandoffBroker;
pub use protocol::{ControlMessage, MemoryUsage};
pub use supervisor::Supervisor;
