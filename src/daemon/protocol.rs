//! Control-channel wire format
//!
//! Length-prefixed binary frames over the supervisor/worker socketpair:
//!
//! ```text
//! ┌────────────┬──────────────────────────────────┐
//! │   Length   │  Payload (bincode of id + body)  │
//! │  (4 bytes) │  (variable length)               │
//! └────────────┴──────────────────────────────────┘
//! ```
//!
//! Every frame carries a correlation id so replies can be matched to calls
//! regardless of ordering. Connection file descriptors ride alongside a
//! `DeliverConnection` frame via `SCM_RIGHTS`.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use crate::bundle::PackageInfo;
use crate::http::RequestMeta;

/// Maximum frame size (16MB, bounds buffered request bodies too)
const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Correlation id: the action name plus a time/random suffix
pub type CorrelationId = String;

/// Everything that crosses the control channel, both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Supervisor → worker: build the application, report its info. The
    /// context is pre-serialized JSON text: the frame codec is not
    /// self-describing, so an untyped JSON value cannot travel directly.
    Init { context: String },
    /// Supervisor → worker: report memory usage
    Memory,
    /// Supervisor → worker: a connection follows as an fd
    DeliverConnection { meta: RequestMeta },
    /// Supervisor → worker: exit cleanly
    Shutdown,
    /// Worker → supervisor: init succeeded
    Package(PackageInfo),
    /// Worker → supervisor: memory report
    MemoryReport(MemoryUsage),
    /// Worker → supervisor: whether the delivered request was responded to
    Handled(bool),
    /// Worker → supervisor: typed failure, never a panic
    Err(String),
}

/// Worker process memory, read best-effort from `/proc/self/status`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Resident set size in bytes
    pub rss: u64,
    /// Virtual size in bytes
    pub heap_total: u64,
    /// Data segment size in bytes
    pub heap_used: u64,
}

impl MemoryUsage {
    pub fn read_self() -> MemoryUsage {
        let mut usage = MemoryUsage::default();
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return usage;
        };
        for line in status.lines() {
            let target = match line.split(':').next() {
                Some("VmRSS") => &mut usage.rss,
                Some("VmSize") => &mut usage.heap_total,
                Some("VmData") => &mut usage.heap_used,
                _ => continue,
            };
            if let Some(kb) = line
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
            {
                *target = kb * 1024;
            }
        }
        usage
    }
}

/// Mint a correlation id for an action, e.g. `socket.m3kp81x4f2a9`
pub fn new_correlation_id(action: &str) -> CorrelationId {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    format!(
        "{}.{}{:06x}",
        action,
        base36(millis),
        rand::random::<u32>() & 0xff_ffff
    )
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).to_string()
}

/// Encode a frame into the wire format
pub fn encode_message(message: &ControlMessage, id: &str) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(&(id, message))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let payload_len = payload.len() as u32;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", payload_len),
        ));
    }
    let mut buffer = Vec::with_capacity(4 + payload.len());
    buffer.extend_from_slice(&payload_len.to_le_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

/// Decode one frame, returning the message and its correlation id
pub fn decode_message<R: Read>(reader: &mut R) -> io::Result<(ControlMessage, CorrelationId)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let payload_len = u32::from_le_bytes(len_bytes);
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", payload_len),
        ));
    }
    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;
    let (id, message): (CorrelationId, ControlMessage) = bincode::deserialize(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((message, id))
}

/// Write one frame to a stream
pub fn write_message<W: Write>(writer: &mut W, message: &ControlMessage, id: &str) -> io::Result<()> {
    let bytes = encode_message(message, id)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from a stream
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<(ControlMessage, CorrelationId)> {
    decode_message(reader)
}

// Unix fd passing via SCM_RIGHTS. One dummy byte must travel with the
// control message.

/// Send a single file descriptor over a Unix socket
pub fn send_fd<S: AsRawFd>(socket: &S, fd: RawFd) -> io::Result<()> {
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

    let dummy = [0u8; 1];
    let iov = [io::IoSlice::new(&dummy)];
    let fds = [fd];
    let rights = ControlMessage::ScmRights(&fds);

    sendmsg::<()>(socket.as_raw_fd(), &iov, &[rights], MsgFlags::empty(), None)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(())
}

/// Receive a single file descriptor from a Unix socket
pub fn recv_fd<S: AsRawFd>(socket: &S) -> io::Result<RawFd> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

    let mut dummy = [0u8; 1];
    let mut iov = [io::IoSliceMut::new(&mut dummy)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    match msg.cmsgs() {
        Ok(cmsgs) => {
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    if let Some(fd) = fds.first() {
                        return Ok(*fd);
                    }
                }
            }
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no file descriptor in control message",
            ))
        }
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_encode_decode_init() {
        let context = serde_json::json!({"env": "test", "flags": [1, 2]});
        let message = ControlMessage::Init {
            context: serde_json::to_string(&context).unwrap(),
        };
        let encoded = encode_message(&message, "init.abc123").unwrap();
        let mut cursor = std::io::Cursor::new(encoded);
        let (decoded, id) = decode_message(&mut cursor).unwrap();
        assert_eq!(message, decoded);
        assert_eq!(id, "init.abc123");

        // The carried text parses back to the original value.
        let ControlMessage::Init { context: carried } = decoded else {
            panic!("expected init");
        };
        let parsed: serde_json::Value = serde_json::from_str(&carried).unwrap();
        assert_eq!(parsed, context);
    }

    #[test]
    fn test_encode_decode_deliver_connection() {
        let meta = RequestMeta::new("POST", "/submit")
            .with_header("content-type", "application/json")
            .with_body(&br#"{"a":1}"#[..]);
        let message = ControlMessage::DeliverConnection { meta };
        let encoded = encode_message(&message, "socket.xyz").unwrap();
        let mut cursor = std::io::Cursor::new(encoded);
        let (decoded, id) = decode_message(&mut cursor).unwrap();
        assert_eq!(message, decoded);
        assert_eq!(id, "socket.xyz");
    }

    #[test]
    fn test_encode_decode_replies() {
        for message in [
            ControlMessage::Handled(true),
            ControlMessage::Handled(false),
            ControlMessage::Err("route.missing".to_string()),
            ControlMessage::MemoryReport(MemoryUsage {
                rss: 1024,
                heap_total: 2048,
                heap_used: 512,
            }),
        ] {
            let encoded = encode_message(&message, "reply.1").unwrap();
            let mut cursor = std::io::Cursor::new(encoded);
            let (decoded, _) = decode_message(&mut cursor).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_multiple_frames_in_sequence() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &ControlMessage::Memory, "memory.1").unwrap();
        write_message(&mut buffer, &ControlMessage::Shutdown, "shutdown.2").unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let (first, first_id) = read_message(&mut cursor).unwrap();
        let (second, second_id) = read_message(&mut cursor).unwrap();
        assert_eq!(first, ControlMessage::Memory);
        assert_eq!(first_id, "memory.1");
        assert_eq!(second, ControlMessage::Shutdown);
        assert_eq!(second_id, "shutdown.2");
    }

    #[test]
    fn test_frame_too_large() {
        let message = ControlMessage::DeliverConnection {
            meta: RequestMeta::new("POST", "/big")
                .with_body(vec![0u8; MAX_MESSAGE_SIZE as usize + 1]),
        };
        assert!(encode_message(&message, "socket.big").is_err());
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = new_correlation_id("socket");
        let b = new_correlation_id("socket");
        assert!(a.starts_with("socket."));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fd_passing_roundtrip() {
        use std::io::{Read, Write};

        let (control_a, control_b) = UnixStream::pair().unwrap();
        let (payload_a, mut payload_b) = UnixStream::pair().unwrap();

        send_fd(&control_a, payload_a.as_raw_fd()).unwrap();
        let received = recv_fd(&control_b).unwrap();
        let mut received = unsafe { UnixStream::from_raw_fd(received) };

        received.write_all(b"through the fd").unwrap();
        drop(received);
        drop(payload_a);

        let mut buf = Vec::new();
        payload_b.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"through the fd");
    }

    #[test]
    fn test_memory_usage_read_self() {
        let usage = MemoryUsage::read_self();
        // On Linux these are populated; elsewhere the default zeros stand.
        if cfg!(target_os = "linux") {
            assert!(usage.rss > 0);
            assert!(usage.heap_total >= usage.rss);
        }
    }
}
