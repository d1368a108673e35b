//! Worker supervision
//!
//! A [`Supervisor`] owns at most one worker process for one application
//! bundle. `start` forks the worker and performs the init handshake;
//! `handle_connection` moves an accepted connection through the rendezvous
//! and control channel; `stop` kills and reaps the worker and tears down
//! the rendezvous listener.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};

use crate::bundle::{PackageInfo, PackageStore, ServeOptions};
use crate::conn::Conn;
use crate::daemon::control::ControlChannel;
use crate::daemon::handoff::HandoffBroker;
use crate::daemon::protocol::{ControlMessage, MemoryUsage};
use crate::daemon::worker;
use crate::error::{GulError, Result};
use crate::http::handler::AppSetup;
use crate::http::RequestMeta;
use crate::sync::lock;

struct WorkerHandle {
    pid: Pid,
    control: Arc<ControlChannel>,
    broker: Arc<HandoffBroker>,
}

/// Supervises one application worker
pub struct Supervisor {
    store: Arc<dyn PackageStore>,
    setup: AppSetup,
    options: ServeOptions,
    worker: Mutex<Option<WorkerHandle>>,
    memory: Arc<Mutex<MemoryUsage>>,
    package: Mutex<Option<PackageInfo>>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn PackageStore>, setup: AppSetup, options: ServeOptions) -> Supervisor {
        Supervisor {
            store,
            setup,
            options,
            worker: Mutex::new(None),
            memory: Arc::new(Mutex::new(MemoryUsage::default())),
            package: Mutex::new(None),
        }
    }

    /// A supervisor with no application setup hook; only the stock
    /// middleware (static assets) is registered.
    pub fn for_bundle(store: Arc<dyn PackageStore>) -> Supervisor {
        let options = store.manifest().serve;
        Self::new(store, Arc::new(|_builder, _context| {}), options)
    }

    /// Fork the worker, perform the init handshake and cache the reported
    /// package info.
    pub fn start(&self, context: serde_json::Value) -> Result<PackageInfo> {
        let mut slot = lock(&self.worker);
        if slot.is_some() {
            return Err(GulError::WorkerRunning);
        }
        let context = serde_json::to_string(&context)
            .map_err(|e| GulError::Protocol(format!("unserializable context: {}", e)))?;

        let (parent_end, child_end) = UnixStream::pair()?;
        match unsafe { fork() }
            .map_err(|e| GulError::Protocol(format!("fork failed: {}", e)))?
        {
            ForkResult::Child => {
                drop(parent_end);
                worker::run(
                    child_end,
                    self.store.clone(),
                    self.setup.clone(),
                    self.options.clone(),
                )
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                let control = Arc::new(ControlChannel::new(parent_end)?);
                let broker = match runtime_dir().and_then(|dir| HandoffBroker::bind(&dir)) {
                    Ok(broker) => Arc::new(broker),
                    Err(e) => {
                        reap(child);
                        return Err(e.into());
                    }
                };

                let info = match control.call("init", ControlMessage::Init { context }) {
                    Ok(ControlMessage::Package(info)) => info,
                    Ok(ControlMessage::Err(message)) => {
                        reap(child);
                        return Err(GulError::Worker(message));
                    }
                    Ok(_) => {
                        reap(child);
                        return Err(GulError::Protocol(
                            "unexpected reply to init".to_string(),
                        ));
                    }
                    Err(e) => {
                        reap(child);
                        return Err(e);
                    }
                };

                tracing::info!(pid = child.as_raw(), name = %info.name, "worker started");
                *lock(&self.package) = Some(info.clone());
                *slot = Some(WorkerHandle {
                    pid: child,
                    control,
                    broker,
                });
                Ok(info)
            }
        }
    }

    /// Kill and reap the worker. Outstanding control calls are rejected by
    /// the channel's exit detection; cached telemetry and the route summary
    /// are cleared.
    pub fn stop(&self) {
        let handle = lock(&self.worker).take();
        let Some(handle) = handle else {
            return;
        };
        tracing::info!(pid = handle.pid.as_raw(), "stopping worker");
        reap(handle.pid);
        handle.broker.shutdown();
        *lock(&self.memory) = MemoryUsage::default();
        if let Some(info) = lock(&self.package).as_mut() {
            info.routes.clear();
        }
    }

    pub fn started(&self) -> bool {
        lock(&self.worker).is_some()
    }

    pub fn worker_pid(&self) -> Option<i32> {
        lock(&self.worker).as_ref().map(|h| h.pid.as_raw())
    }

    /// Last package info reported by the worker
    pub fn package(&self) -> Option<PackageInfo> {
        lock(&self.package).clone()
    }

    /// Cached worker memory usage. Each read also kicks off a background
    /// refresh so the cache trails the worker by one call.
    pub fn memory(&self) -> MemoryUsage {
        let control = lock(&self.worker).as_ref().map(|h| h.control.clone());
        if let Some(control) = control {
            let cache = self.memory.clone();
            thread::spawn(move || {
                if let Ok(ControlMessage::MemoryReport(usage)) =
                    control.call("memory", ControlMessage::Memory)
                {
                    *crate::sync::lock(&cache) = usage;
                }
            });
        }
        *lock(&self.memory)
    }

    /// Offer a connection to the worker. Exactly one of two things happens:
    /// the worker handles the request, or `next` is invoked (with an error
    /// when delivery itself failed).
    pub fn handle_connection<F>(&self, meta: RequestMeta, conn: Box<dyn Conn>, next: F)
    where
        F: FnOnce(Option<GulError>),
    {
        let endpoints = {
            let slot = lock(&self.worker);
            slot.as_ref().map(|h| (h.control.clone(), h.broker.clone()))
        };
        let Some((control, broker)) = endpoints else {
            next(None);
            return;
        };

        let rendezvous = match broker.handoff(conn) {
            Ok(stream) => stream,
            Err(e) => {
                next(Some(e));
                return;
            }
        };

        let reply = control.call_with_fd(
            "socket",
            ControlMessage::DeliverConnection { meta },
            rendezvous.as_raw_fd(),
        );

        match reply {
            Ok(ControlMessage::Handled(true)) => {}
            Ok(ControlMessage::Handled(false)) => next(None),
            Ok(ControlMessage::Err(message)) if message.starts_with("route.missing") => next(None),
            Ok(ControlMessage::Err(message)) => next(Some(GulError::Worker(message))),
            Ok(_) => next(Some(GulError::Protocol(
                "unexpected reply to connection delivery".to_string(),
            ))),
            Err(e) => next(Some(e)),
        }
        // Our copy of the rendezvous must outlive `next`: once both copies
        // are closed the pumps see EOF and half-close the client, which
        // would cut off a fallback still writing to it.
        drop(rendezvous);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reap(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}

fn runtime_dir() -> std::io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let base = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
    let dir = base.join("gul");
    std::fs::create_dir_all(&dir)?;
    let mut perms = std::fs::metadata(&dir)?.permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(&dir, perms)?;
    Ok(dir)
}
