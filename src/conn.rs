//! Duplex connection abstraction
//!
//! The supervisor accepts connections from arbitrary transports and hands
//! them to the rendezvous machinery as boxed [`Conn`] objects. Anything that
//! is a readable/writable byte stream with an independent shutdown works;
//! the standard Unix and TCP streams are covered here.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;

/// A transferable duplex byte stream.
///
/// `try_clone_conn` yields a second handle to the same underlying socket so
/// one side can be pumped while the other is force-closed.
pub trait Conn: Read + Write + Send {
    /// Clone the underlying handle
    fn try_clone_conn(&self) -> io::Result<Box<dyn Conn>>;

    /// Half-close: no more bytes will be written
    fn shutdown_write(&self) -> io::Result<()>;

    /// Full close of both directions
    fn shutdown_both(&self) -> io::Result<()>;
}

impl Conn for UnixStream {
    fn try_clone_conn(&self) -> io::Result<Box<dyn Conn>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Conn for TcpStream {
    fn try_clone_conn(&self) -> io::Result<Box<dyn Conn>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}
