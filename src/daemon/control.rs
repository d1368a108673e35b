//! Correlated request/response RPC over the worker socketpair
//!
//! One writer, many callers: each call mints a correlation id, parks a
//! channel under it and blocks until the reader thread dispatches the
//! matching reply. When the worker goes away every parked caller is
//! rejected so nothing waits forever.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crate::daemon::protocol::{self, ControlMessage, CorrelationId};
use crate::error::{GulError, Result};
use crate::sync::lock;

type Pending = Arc<Mutex<HashMap<CorrelationId, mpsc::Sender<Result<ControlMessage>>>>>;

/// Supervisor-side endpoint of the control channel
pub struct ControlChannel {
    writer: Mutex<UnixStream>,
    pending: Pending,
    alive: Arc<AtomicBool>,
}

impl ControlChannel {
    /// Take ownership of the supervisor end of the socketpair and start the
    /// reply dispatcher.
    pub fn new(stream: UnixStream) -> std::io::Result<ControlChannel> {
        let reader = stream.try_clone()?;
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let dispatcher_pending = pending.clone();
        let dispatcher_alive = alive.clone();
        thread::spawn(move || dispatch_replies(reader, dispatcher_pending, dispatcher_alive));

        Ok(ControlChannel {
            writer: Mutex::new(stream),
            pending,
            alive,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a request and block until its reply arrives
    pub fn call(&self, action: &str, message: ControlMessage) -> Result<ControlMessage> {
        self.send(action, message, None)
    }

    /// Like `call`, but ships a file descriptor right behind the frame
    pub fn call_with_fd(
        &self,
        action: &str,
        message: ControlMessage,
        fd: RawFd,
    ) -> Result<ControlMessage> {
        self.send(action, message, Some(fd))
    }

    fn send(&self, action: &str, message: ControlMessage, fd: Option<RawFd>) -> Result<ControlMessage> {
        if !self.is_alive() {
            return Err(GulError::WorkerExited);
        }
        let id = protocol::new_correlation_id(action);
        let (tx, rx) = mpsc::channel();
        lock(&self.pending).insert(id.clone(), tx);

        {
            // Frame and fd must stay adjacent on the wire.
            let mut writer = lock(&self.writer);
            let written = protocol::write_message(&mut *writer, &message, &id).and_then(|_| {
                match fd {
                    Some(fd) => protocol::send_fd(&*writer, fd),
                    None => Ok(()),
                }
            });
            if let Err(e) = written {
                lock(&self.pending).remove(&id);
                return Err(e.into());
            }
        }

        match rx.recv() {
            Ok(reply) => reply,
            Err(_) => Err(GulError::WorkerExited),
        }
    }
}

fn dispatch_replies(mut reader: UnixStream, pending: Pending, alive: Arc<AtomicBool>) {
    loop {
        match protocol::read_message(&mut reader) {
            Ok((message, id)) => {
                let waiter = lock(&pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(message));
                    }
                    None => tracing::warn!(%id, "reply with unknown correlation id dropped"),
                }
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    tracing::warn!(error = %e, "control channel read failed");
                }
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    // Reject every outstanding call; the worker is gone.
    for (_, waiter) in lock(&pending).drain() {
        let _ = waiter.send(Err(GulError::WorkerExited));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // Minimal worker stand-in that answers every frame on a socketpair.
    fn echo_peer(mut peer: UnixStream) {
        thread::spawn(move || {
            let mut writer = peer.try_clone().unwrap();
            while let Ok((message, id)) = protocol::read_message(&mut peer) {
                let reply = match message {
                    ControlMessage::Memory => ControlMessage::MemoryReport(Default::default()),
                    ControlMessage::Shutdown => break,
                    _ => ControlMessage::Err("unexpected".to_string()),
                };
                protocol::write_message(&mut writer, &reply, &id).unwrap();
            }
        });
    }

    #[test]
    fn test_call_gets_matching_reply() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        echo_peer(theirs);
        let channel = ControlChannel::new(ours).unwrap();

        let reply = channel.call("memory", ControlMessage::Memory).unwrap();
        assert!(matches!(reply, ControlMessage::MemoryReport(_)));
        assert!(channel.is_alive());
    }

    #[test]
    fn test_concurrent_calls_resolve_independently() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        echo_peer(theirs);
        let channel = Arc::new(ControlChannel::new(ours).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let channel = channel.clone();
            handles.push(thread::spawn(move || {
                channel.call("memory", ControlMessage::Memory)
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.join().unwrap().unwrap(),
                ControlMessage::MemoryReport(_)
            ));
        }
    }

    #[test]
    fn test_peer_exit_rejects_outstanding_calls() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let channel = Arc::new(ControlChannel::new(ours).unwrap());

        // A call that will never be answered.
        let caller = {
            let channel = channel.clone();
            thread::spawn(move || channel.call("memory", ControlMessage::Memory))
        };
        thread::sleep(Duration::from_millis(30));
        drop(theirs);

        let outcome = caller.join().unwrap();
        assert!(matches!(outcome, Err(GulError::WorkerExited)));
    }

    #[test]
    fn test_dead_channel_rejects_immediately() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        let channel = ControlChannel::new(ours).unwrap();
        thread::sleep(Duration::from_millis(30));

        assert!(!channel.is_alive());
        assert!(matches!(
            channel.call("memory", ControlMessage::Memory),
            Err(GulError::WorkerExited)
        ));
    }
}
