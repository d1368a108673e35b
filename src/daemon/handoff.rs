//! Connection handoff rendezvous
//!
//! For each delivered connection the supervisor dials a fresh `UnixStream`
//! to its own private listener and writes a random fixed-length id as the
//! first bytes. The accept side reads the id, claims the matching pending
//! record exactly once and links the accepted socket to the client
//! connection with a pump thread per direction. The dialed stream's fd is
//! what ships to the worker.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::conn::Conn;
use crate::error::{GulError, Result};
use crate::sync::lock;

/// Handoff ids are fixed-length so the handshake read is exact
pub const HANDOFF_ID_LEN: usize = 32;

/// How long a dialed rendezvous may wait to be claimed
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the accept side waits for the id bytes
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);

struct HandoffRecord {
    client: Box<dyn Conn>,
    claimed: mpsc::Sender<()>,
}

type PendingMap = Arc<Mutex<HashMap<String, HandoffRecord>>>;

/// Rendezvous listener scoped to one worker lifetime
pub struct HandoffBroker {
    path: PathBuf,
    pending: PendingMap,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl HandoffBroker {
    /// Bind a listener on a unique socket path under `dir`
    pub fn bind(dir: &Path) -> std::io::Result<HandoffBroker> {
        let path = dir.join(format!("rdv-{:016x}.sock", rand::random::<u64>()));
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_pending = pending.clone();
        let accept_shutdown = shutdown.clone();
        let accept_thread = thread::spawn(move || {
            accept_loop(listener, accept_pending, accept_shutdown);
        });

        Ok(HandoffBroker {
            path,
            pending,
            shutdown,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand a client connection off: dial the rendezvous, park the client
    /// under a fresh id and wait for the accept side to claim it. Returns
    /// the dialed stream whose fd goes to the worker.
    pub fn handoff(&self, client: Box<dyn Conn>) -> Result<UnixStream> {
        let rendezvous = UnixStream::connect(&self.path)?;
        let id = new_handoff_id();
        let (tx, rx) = mpsc::channel();
        lock(&self.pending).insert(
            id.clone(),
            HandoffRecord {
                client,
                claimed: tx,
            },
        );

        let mut writer = match rendezvous.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                lock(&self.pending).remove(&id);
                return Err(e.into());
            }
        };
        if let Err(e) = writer.write_all(id.as_bytes()).and_then(|_| writer.flush()) {
            lock(&self.pending).remove(&id);
            return Err(e.into());
        }

        match rx.recv_timeout(HANDOFF_TIMEOUT) {
            Ok(()) => Ok(rendezvous),
            Err(_) => {
                // Never claimed; drop the record so the client closes.
                lock(&self.pending).remove(&id);
                Err(GulError::HandoffTimeout)
            }
        }
    }

    /// Stop accepting, drop pending records, remove the socket file
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.accept_thread).take() {
            let _ = handle.join();
        }
        lock(&self.pending).clear();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for HandoffBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn new_handoff_id() -> String {
    format!(
        "{:016x}{:016x}",
        rand::random::<u64>(),
        rand::random::<u64>()
    )
}

fn accept_loop(listener: UnixListener, pending: PendingMap, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                // Handshakes run off-thread so a slow dialer never blocks
                // acceptance.
                let pending = pending.clone();
                thread::spawn(move || handshake(stream, pending));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::warn!(error = %e, "rendezvous accept failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handshake(stream: UnixStream, pending: PendingMap) {
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    let _ = stream.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT));

    let mut id = [0u8; HANDOFF_ID_LEN];
    let mut reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(_) => return,
    };
    if reader.read_exact(&mut id).is_err() {
        return;
    }
    let id = match std::str::from_utf8(&id) {
        Ok(id) => id.to_string(),
        Err(_) => return,
    };

    // Claim exactly once; an unknown id tears the connection down.
    let record = lock(&pending).remove(&id);
    let Some(record) = record else {
        tracing::warn!(%id, "rendezvous with unknown handoff id dropped");
        return;
    };

    let _ = stream.set_read_timeout(None);
    link(stream, record.client);
    let _ = record.claimed.send(());
}

/// Wire the accepted rendezvous socket to the client, both directions
fn link(accepted: UnixStream, client: Box<dyn Conn>) {
    let client_reader = match client.try_clone_conn() {
        Ok(clone) => clone,
        Err(e) => {
            tracing::warn!(error = %e, "client connection clone failed");
            return;
        }
    };
    let accepted_writer = match accepted.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            tracing::warn!(error = %e, "rendezvous connection clone failed");
            return;
        }
    };
    thread::spawn(move || pump(Box::new(accepted), client));
    thread::spawn(move || pump(client_reader, Box::new(accepted_writer)));
}

fn pump(mut from: Box<dyn Conn>, mut to: Box<dyn Conn>) {
    let mut buf = [0u8; 8192];
    loop {
        match from.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if to.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
    let _ = to.shutdown_write();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn broker() -> (HandoffBroker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let broker = HandoffBroker::bind(dir.path()).unwrap();
        (broker, dir)
    }

    #[test]
    fn test_handoff_links_both_directions() {
        let (broker, _dir) = broker();
        let (client, mut peer) = UnixStream::pair().unwrap();

        let mut rendezvous = broker.handoff(Box::new(client)).unwrap();

        // Worker → client direction.
        rendezvous.write_all(b"from worker").unwrap();
        let mut buf = [0u8; 11];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"from worker");

        // Client → worker direction.
        peer.write_all(b"from client").unwrap();
        let mut buf = [0u8; 11];
        rendezvous.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"from client");
    }

    #[test]
    fn test_closing_rendezvous_propagates_eof() {
        let (broker, _dir) = broker();
        let (client, mut peer) = UnixStream::pair().unwrap();

        let rendezvous = broker.handoff(Box::new(client)).unwrap();
        drop(rendezvous);

        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_id_is_dropped() {
        let (broker, _dir) = broker();

        let mut stranger = UnixStream::connect(broker.path()).unwrap();
        stranger
            .write_all("f".repeat(HANDOFF_ID_LEN).as_bytes())
            .unwrap();

        let mut buf = Vec::new();
        stranger.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_concurrent_handoffs_pair_correctly() {
        let (broker, _dir) = broker();
        let broker = Arc::new(broker);

        let mut handles = Vec::new();
        for i in 0..4u8 {
            let broker = broker.clone();
            handles.push(thread::spawn(move || {
                let (client, mut peer) = UnixStream::pair().unwrap();
                let mut rendezvous = broker.handoff(Box::new(client)).unwrap();
                rendezvous.write_all(&[i]).unwrap();
                let mut buf = [0u8; 1];
                peer.read_exact(&mut buf).unwrap();
                assert_eq!(buf[0], i);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_shutdown_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let broker = HandoffBroker::bind(dir.path()).unwrap();
        let path = broker.path().to_path_buf();
        assert!(path.exists());
        broker.shutdown();
        assert!(!path.exists());
    }
}
