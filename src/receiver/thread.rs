//! Per-connection receive worker.
//!
//! Each worker owns one listening socket, one statistics record and one
//! fixed-size receive buffer. It accepts connections one at a time and
//! runs the frame loop over each until the stream ends, the sender signals
//! DONE, or a fatal error occurs. The buffer is reused across blocks:
//! header parsing interleaves with bulk payload writes, and bytes of the
//! next frame that arrive behind a block's payload are carried in place
//! rather than re-read.

use crate::error::{ErrorCode, TransferError};
use crate::file_creator::FileCreator;
use crate::protocol::{self, DONE_CMD, EXIT_CMD, FILE_CMD, MAX_HEADER};
use crate::socket::ServerSocket;
use crate::stats::TransferStats;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Per-worker slice of the session configuration, passed by value.
#[derive(Debug, Clone)]
pub(crate) struct WorkerConfig {
    pub buffer_size: usize,
    pub skip_writes: bool,
    pub max_retries: u32,
    pub sleep_millis: u64,
    pub joinable: bool,
}

/// Read into `buf[len..]` until at least `at_least` valid bytes sit in
/// `buf`, accumulating across as many socket reads as needed.
///
/// Return convention (callers treat `Err(_)` and `Ok(0)` as abort):
/// - `Err(e)` only when a read fails with nothing buffered at all;
/// - `Ok(len)` with `len < at_least` after EOF, or after a read error when
///   earlier reads already buffered data (the partial bytes stay
///   parseable);
/// - `Ok(len)` with `len >= at_least` otherwise.
pub(crate) fn read_at_least(
    socket: &mut ServerSocket,
    buf: &mut [u8],
    at_least: usize,
    mut len: usize,
) -> io::Result<usize> {
    trace!(len, at_least, max = buf.len(), "read_at_least");
    let mut count = 0u32;
    while len < at_least {
        let n = match socket.read(&mut buf[len..]) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, count, "read error");
                if len > 0 {
                    return Ok(len);
                }
                return Err(e);
            }
        };
        if n == 0 {
            debug!(count, len, "eof while filling buffer");
            return Ok(len);
        }
        len += n;
        count += 1;
    }
    trace!(count, len, "read_at_least complete");
    Ok(len)
}

/// Perform exactly one read of up to `min(buf.len(), at_most)` bytes.
/// `Ok(0)` is EOF; errors are returned as-is.
pub(crate) fn read_at_most(
    socket: &mut ServerSocket,
    buf: &mut [u8],
    at_most: usize,
) -> io::Result<usize> {
    let target = at_most.min(buf.len());
    let n = socket.read(&mut buf[..target])?;
    if n == 0 {
        warn!("eof on connection");
    }
    trace!(n, at_most, "read_at_most");
    Ok(n)
}

/// Fixed-size receive window over a connection's byte stream.
///
/// Valid bytes live at `buf[head .. head + len]`. Parsing advances `head`;
/// [`RecvBuffer::fill`] tops the window up by reading past `head + len`.
/// The buffer never grows and `head + len <= capacity` always holds.
pub(crate) struct RecvBuffer {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl RecvBuffer {
    pub fn new(capacity: usize) -> Result<Self, TransferError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity).map_err(|e| {
            TransferError::Memory(format!(
                "failed to allocate {} byte receive buffer: {}",
                capacity, e
            ))
        })?;
        buf.resize(capacity, 0);
        Ok(Self {
            buf,
            head: 0,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn head(&self) -> usize {
        self.head
    }

    /// Valid bytes currently in the window.
    pub fn available(&self) -> usize {
        self.len
    }

    /// The valid window.
    pub fn window(&self) -> &[u8] {
        &self.buf[self.head..self.head + self.len]
    }

    /// Byte at window position `i`.
    ///
    /// `i` may point past the valid window (the frame loop reads command
    /// and status slots before knowing how many bytes a frame actually
    /// carries, exactly as short frames are laid out on the wire); the
    /// underlying buffer is always allocated, and frame-length checks
    /// reject any frame short enough for the slot to be stale.
    pub fn peek(&self, i: usize) -> u8 {
        self.buf[self.head + i]
    }

    /// Top the window up to at least `at_least` valid bytes, following the
    /// [`read_at_least`] convention for the returned length.
    pub fn fill(&mut self, socket: &mut ServerSocket, at_least: usize) -> io::Result<usize> {
        let head = self.head;
        let n = read_at_least(socket, &mut self.buf[head..], at_least, self.len)?;
        self.len = n;
        Ok(n)
    }

    /// Consume `n` bytes from the front of the window.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.head += n;
        self.len -= n;
    }

    /// Keep leftover bytes for the next frame. A short leftover sitting in
    /// the back half of the buffer is copied down to the front so the next
    /// header is guaranteed to fit; otherwise the bytes stay in place
    /// (amortized zero-copy reuse).
    pub fn carry_leftover(&mut self) {
        if self.len < MAX_HEADER && self.head > self.capacity() / 2 {
            trace!(leftover = self.len, head = self.head, "compacting leftover");
            self.buf.copy_within(self.head..self.head + self.len, 0);
            self.head = 0;
        } else {
            trace!(leftover = self.len, head = self.head, "leaving leftover in place");
        }
    }

    /// Empty the window.
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// The whole buffer as scratch space for bulk draining. Only valid
    /// while the window is empty.
    pub fn scratch(&mut self) -> &mut [u8] {
        debug_assert!(self.len == 0);
        &mut self.buf
    }

    #[cfg(test)]
    fn seed(&mut self, head: usize, bytes: &[u8]) {
        self.buf[head..head + bytes.len()].copy_from_slice(bytes);
        self.head = head;
        self.len = bytes.len();
    }
}

/// Sender-initiated emergency stop. Terminates the whole process without
/// unwinding other workers; kept in one place so a different termination
/// hook could be substituted.
fn exit_process() -> ! {
    std::process::exit(0)
}

enum ConnectionOutcome {
    /// The sender signalled DONE on a joinable session; the worker is done.
    SessionEnd,
    /// Keep accepting connections.
    KeepServing,
}

/// Worker bound to one port for the lifetime of a session.
pub(crate) struct ReceiverThread {
    socket: ServerSocket,
    creator: Arc<FileCreator>,
    stats: Arc<TransferStats>,
    config: WorkerConfig,
}

impl ReceiverThread {
    pub fn new(
        socket: ServerSocket,
        creator: Arc<FileCreator>,
        stats: Arc<TransferStats>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            socket,
            creator,
            stats,
            config,
        }
    }

    /// Serve connections until the session ends or a fatal error occurs.
    pub fn run(mut self) {
        let port = self.socket.port();
        debug!(
            port,
            dir = %self.creator.root().display(),
            writes = !self.config.skip_writes,
            "receiver worker starting"
        );
        if !self.listen_with_retry() {
            return;
        }
        let mut rbuf = match RecvBuffer::new(self.config.buffer_size) {
            Ok(rbuf) => rbuf,
            Err(e) => {
                error!(port, error = %e, "buffer allocation failed");
                self.stats.set_error_code(ErrorCode::MemoryAllocationError);
                return;
            }
        };
        self.stats.set_error_code(ErrorCode::Ok);
        loop {
            if let Err(e) = self.socket.accept_next_connection() {
                debug!(port, error = %e, "accept failed, worker terminating");
                self.stats.set_error_code(ErrorCode::ConnError);
                return;
            }
            let outcome = self.serve_connection(&mut rbuf);
            self.socket.close_current_connection();
            if let ConnectionOutcome::SessionEnd = outcome {
                info!(port, blocks = self.stats.num_blocks(), "receiver worker done");
                return;
            }
        }
    }

    /// Bind and listen, retrying transient failures. The listen call is
    /// attempted `max_retries` times in total: `max_retries - 1` in the
    /// retry loop, then one final attempt.
    fn listen_with_retry(&mut self) -> bool {
        let port = self.socket.port();
        for attempt in 1..self.config.max_retries {
            match self.socket.listen() {
                Ok(()) => break,
                Err(TransferError::Network(e)) => {
                    error!(port, error = %e, "unrecoverable listen failure");
                    self.stats.set_error_code(ErrorCode::ConnError);
                    return false;
                }
                Err(e) => {
                    info!(port, attempt, error = %e, "sleeping after failed listen attempt");
                    thread::sleep(Duration::from_millis(self.config.sleep_millis));
                }
            }
        }
        if self.socket.listen().is_err() {
            error!(port, "unable to listen/bind despite retries");
            self.stats.set_error_code(ErrorCode::ConnError);
            return false;
        }
        true
    }

    /// Run the frame loop over the current connection.
    fn serve_connection(&mut self, rbuf: &mut RecvBuffer) -> ConnectionOutcome {
        let port = self.socket.port();
        rbuf.reset();
        loop {
            let n = match rbuf.fill(&mut self.socket, MAX_HEADER) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let cmd = rbuf.peek(0);
            if cmd == EXIT_CMD {
                if n != 1 {
                    error!(port, n, "junk content around exit command, ignoring");
                    self.stats.set_error_code(ErrorCode::ProtocolError);
                    break;
                }
                error!(port, "got exit command, terminating process");
                exit_process();
            }
            let status = ErrorCode::from_u8(rbuf.peek(1));
            if cmd == DONE_CMD {
                debug!(port, "got done command");
                if n != 2 {
                    error!(port, n, "unexpected frame length for done command");
                    self.stats.set_error_code(ErrorCode::ProtocolError);
                    break;
                }
                if !status.is_ok() {
                    self.stats.set_remote_error_code(status);
                    error!(
                        port,
                        remote = %status,
                        local = %self.stats.error_code(),
                        "sender transmitted errors"
                    );
                }
                // Echo the command byte, replacing the status slot with
                // this worker's own code.
                let reply = [DONE_CMD, self.stats.error_code().as_u8()];
                if let Err(e) = self.socket.write_all(&reply) {
                    warn!(port, error = %e, "failed to write done reply");
                }
                self.stats.add_header_bytes(2);
                self.stats.add_effective_bytes(2, 0);
                if self.config.joinable {
                    return ConnectionOutcome::SessionEnd;
                }
                // In daemon mode each done command closes out one
                // transfer; the next one starts error free.
                self.stats.set_error_code(ErrorCode::Ok);
                break;
            }
            if cmd != FILE_CMD {
                error!(port, cmd, n, off = rbuf.head(), "unexpected command byte");
                self.stats.set_error_code(ErrorCode::ProtocolError);
                break;
            }
            if !status.is_ok() {
                debug!(port, status = %status, "sender entered an error state");
            }
            if !self.receive_block(rbuf, n) {
                break;
            }
        }
        ConnectionOutcome::KeepServing
    }

    /// Decode one FILE header and consume its payload. Returns false when
    /// the frame loop must stop (decode failure or a truncated block).
    fn receive_block(&mut self, rbuf: &mut RecvBuffer, n: usize) -> bool {
        let port = self.socket.port();
        // Command and status bytes precede the header fields.
        let mut cursor = 2usize;
        let decoded = protocol::decode(rbuf.window(), &mut cursor, n);
        let header_bytes = cursor as u64;
        self.stats.add_header_bytes(header_bytes);
        let header = match decoded {
            Ok(header) => header,
            Err(e) => {
                error!(port, n, error = %e, "error decoding block header");
                self.stats.set_error_code(ErrorCode::ProtocolError);
                self.stats.incr_failed_attempts();
                return false;
            }
        };
        trace!(
            port,
            id = %header.id,
            size = header.source_size,
            offset = header.offset,
            "receiving block"
        );

        let mut dest = self.open_destination(&header);

        // Whatever payload is already buffered behind the header gets
        // written first, straight from the receive window.
        let remaining_data = n - cursor;
        let to_write = remaining_data.min(header.source_size as usize);
        self.stats.add_data_bytes(to_write as u64);
        if let Some(file) = dest.as_mut() {
            let payload = &rbuf.window()[cursor..cursor + to_write];
            if let Err(e) = file.write_all(payload) {
                error!(port, id = %header.id, error = %e, "write error");
                self.stats.set_error_code(ErrorCode::FileWriteError);
                dest = None;
            }
        }
        rbuf.advance(cursor + to_write);
        let mut wres = to_write as u64;

        // Drain the rest of the block. Reaching here means the buffered
        // payload fell short of the block, so the window is empty and the
        // whole buffer is free scratch space.
        while wres < header.source_size {
            let want = (header.source_size - wres).min(rbuf.capacity() as u64) as usize;
            let nres = match read_at_most(&mut self.socket, rbuf.scratch(), want) {
                Ok(0) | Err(_) => break,
                Ok(nres) => nres,
            };
            self.stats.add_data_bytes(nres as u64);
            if let Some(file) = dest.as_mut() {
                if let Err(e) = file.write_all(&rbuf.scratch()[..nres]) {
                    error!(port, id = %header.id, error = %e, "write error");
                    self.stats.set_error_code(ErrorCode::FileWriteError);
                    dest = None;
                }
            }
            wres += nres as u64;
        }
        if wres != header.source_size {
            // Only transmission errors leave a block short; disk errors
            // already drained the remainder above.
            self.stats.incr_failed_attempts();
            return false;
        }
        drop(dest);
        self.stats
            .add_effective_bytes(header_bytes, header.source_size);
        self.stats.incr_num_blocks();
        debug!(port, id = %header.id, size = header.source_size, "block complete");

        if rbuf.available() > 0 {
            rbuf.carry_leftover();
        } else {
            rbuf.reset();
        }
        true
    }

    /// Open, position and size the destination for a block. Failures are
    /// recorded and the block's payload is drained unwritten.
    fn open_destination(&mut self, header: &protocol::BlockHeader) -> Option<File> {
        if self.config.skip_writes {
            return None;
        }
        let port = self.socket.port();
        let mut file = match self.creator.create(&header.id) {
            Ok(file) => file,
            Err(e) => {
                error!(port, id = %header.id, error = %e, "unable to open destination");
                self.stats.set_error_code(ErrorCode::FileWriteError);
                return None;
            }
        };
        if header.offset > 0 {
            if let Err(e) = file.seek(SeekFrom::Start(header.offset)) {
                error!(port, id = %header.id, error = %e, "unable to seek destination");
                self.stats.set_error_code(ErrorCode::FileWriteError);
                return None;
            }
        } else if let Err(e) = self.creator.truncate(&file, header.file_size) {
            warn!(port, id = %header.id, error = %e, "unable to size destination");
        }
        Some(file)
    }
}
