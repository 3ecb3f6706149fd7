//! Non-blocking read results and write buffering shared by transports.
//!
//! Every socket touched inside the event loop is driven through
//! `try_read`/`try_write`: a would-block result is never an error, it just
//! means the operation is retried after the next readiness notification.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::net::TcpStream;

/// Default number of bytes requested from a socket per read.
pub const READ_CHUNK: usize = 4096;

/// Outcome of a single non-blocking read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    /// Bytes were available.
    Data(Bytes),
    /// Nothing was available yet; the stream is still open.
    Empty,
    /// The peer finished sending.
    Eof,
}

impl Received {
    /// Returns `true` for [`Received::Eof`].
    #[must_use]
    pub fn is_eof(&self) -> bool { matches!(self, Self::Eof) }
}

/// Read at most `limit` bytes from `stream` without blocking.
///
/// # Errors
///
/// Returns any I/O error other than `WouldBlock`/`Interrupted`.
pub fn try_recv(stream: &TcpStream, limit: usize) -> io::Result<Received> {
    let mut buf = BytesMut::with_capacity(limit);
    match stream.try_read_buf(&mut buf) {
        Ok(0) => Ok(Received::Eof),
        Ok(_) => Ok(Received::Data(buf.freeze())),
        Err(e) if is_transient(&e) => Ok(Received::Empty),
        Err(e) => Err(e),
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Output queued for a non-blocking socket.
#[derive(Debug, Default)]
pub struct SendBuffer {
    buf: BytesMut,
}

impl SendBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append `data` to the queued output.
    pub fn push(&mut self, data: &[u8]) { self.buf.extend_from_slice(data); }

    /// Returns `true` when nothing is waiting to be written.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    /// Number of queued bytes.
    #[must_use]
    pub fn len(&self) -> usize { self.buf.len() }

    /// Write as much queued output to `stream` as it accepts right now.
    ///
    /// Returns `true` once the buffer is fully drained.
    ///
    /// # Errors
    ///
    /// Returns any I/O error other than `WouldBlock`/`Interrupted`, or
    /// `WriteZero` if the socket stops accepting bytes.
    pub fn flush_to(&mut self, stream: &TcpStream) -> io::Result<bool> {
        while !self.buf.is_empty() {
            match stream.try_write(&self.buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.buf.advance(n),
                Err(e) if is_transient(&e) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Drop any queued output.
    pub fn clear(&mut self) { self.buf.clear(); }
}
