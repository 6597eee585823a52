//! Blocking per-port listening socket.
//!
//! Each worker owns one [`ServerSocket`]: a listener bound to a single
//! port serving one accepted connection at a time. The socket itself never
//! crosses threads; the stall watchdog instead holds a [`ShutdownHandle`],
//! which can only issue `shutdown(SHUT_RDWR)` on the descriptors to force
//! the owner out of a blocked `accept` or `read`. Descriptor slots are
//! published atomically by the owner and stay valid for the session: the
//! listener is never closed and replaced while a handle is live.

use crate::error::TransferError;
use socket2::{Domain, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::debug;

const NO_FD: i32 = -1;

#[derive(Debug)]
struct SocketFds {
    listen: AtomicI32,
    conn: AtomicI32,
}

/// A listening socket on one port, serving sequential connections.
#[derive(Debug)]
pub struct ServerSocket {
    port: u16,
    backlog: i32,
    listener: Option<TcpListener>,
    conn: Option<TcpStream>,
    fds: Arc<SocketFds>,
}

impl ServerSocket {
    pub fn new(port: u16, backlog: i32) -> Self {
        Self {
            port,
            backlog,
            listener: None,
            conn: None,
            fds: Arc::new(SocketFds {
                listen: AtomicI32::new(NO_FD),
                conn: AtomicI32::new(NO_FD),
            }),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind and listen; a no-op once listening.
    ///
    /// Socket creation failure is unrecoverable and reported as
    /// [`TransferError::Network`]; bind and listen failures come back as
    /// [`TransferError::Io`] and may be retried by the caller.
    pub fn listen(&mut self) -> Result<(), TransferError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(|e| {
            TransferError::Network(format!("failed to create socket for port {}: {}", self.port, e))
        })?;
        socket.set_reuse_address(true)?;
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        socket.bind(&addr.into())?;
        socket.listen(self.backlog)?;

        let listener = TcpListener::from(socket);
        self.fds.listen.store(listener.as_raw_fd(), Ordering::SeqCst);
        debug!(port = self.port, backlog = self.backlog, "listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Block until the next connection arrives and make it current.
    pub fn accept_next_connection(&mut self) -> Result<(), TransferError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| TransferError::Network(format!("port {} is not listening", self.port)))?;
        let (stream, remote) = listener.accept()?;
        debug!(port = self.port, remote = %remote, "accepted connection");
        self.fds.conn.store(stream.as_raw_fd(), Ordering::SeqCst);
        self.conn = Some(stream);
        Ok(())
    }

    /// Read from the current connection.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.conn.as_mut() {
            Some(stream) => stream.read(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Write all of `buf` to the current connection.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.conn.as_mut() {
            Some(stream) => stream.write_all(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Close the current connection, clearing its descriptor slot first so
    /// the watchdog never targets a recycled descriptor.
    pub fn close_current_connection(&mut self) {
        self.fds.conn.store(NO_FD, Ordering::SeqCst);
        self.conn = None;
    }

    /// Capability for the stall watchdog to force this socket out of
    /// blocked syscalls.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            port: self.port,
            fds: Arc::clone(&self.fds),
        }
    }
}

/// Shutdown-only view of a [`ServerSocket`], safe to hold on another
/// thread. Absent descriptors are ignored.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    port: u16,
    fds: Arc<SocketFds>,
}

impl ShutdownHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shut down the listening descriptor, failing any blocked `accept`.
    pub fn shutdown_listener(&self) -> io::Result<()> {
        shutdown_fd(self.fds.listen.load(Ordering::SeqCst))
    }

    /// Shut down the currently accepted descriptor, failing any blocked
    /// `read` or `write`.
    pub fn shutdown_connection(&self) -> io::Result<()> {
        shutdown_fd(self.fds.conn.load(Ordering::SeqCst))
    }
}

fn shutdown_fd(fd: i32) -> io::Result<()> {
    if fd == NO_FD {
        return Ok(());
    }
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_listen_is_idempotent() {
        let mut socket = ServerSocket::new(free_port(), 1);
        socket.listen().unwrap();
        socket.listen().unwrap();
    }

    #[test]
    fn test_accept_read_write_roundtrip() {
        let port = free_port();
        let mut socket = ServerSocket::new(port, 1);
        socket.listen().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).unwrap();
            reply
        });

        socket.accept_next_connection().unwrap();
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += socket.read(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"ping");
        socket.write_all(b"pong").unwrap();
        socket.close_current_connection();

        assert_eq!(&client.join().unwrap(), b"pong");
    }

    #[test]
    fn test_read_without_connection() {
        let mut socket = ServerSocket::new(free_port(), 1);
        socket.listen().unwrap();
        let mut buf = [0u8; 1];
        assert!(socket.read(&mut buf).is_err());
    }

    #[test]
    fn test_shutdown_unblocks_accept() {
        let port = free_port();
        let mut socket = ServerSocket::new(port, 1);
        socket.listen().unwrap();
        let handle = socket.shutdown_handle();

        let acceptor = thread::spawn(move || socket.accept_next_connection());

        thread::sleep(Duration::from_millis(50));
        handle.shutdown_listener().unwrap();

        assert!(acceptor.join().unwrap().is_err());
    }

    #[test]
    fn test_shutdown_ignores_absent_connection() {
        let socket = ServerSocket::new(free_port(), 1);
        let handle = socket.shutdown_handle();
        handle.shutdown_listener().unwrap();
        handle.shutdown_connection().unwrap();
    }
}
