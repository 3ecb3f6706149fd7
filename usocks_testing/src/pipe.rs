//! In-memory [`BackendStream`] pairs.
//!
//! Bytes written to one [`PipeEnd`] become readable on the other. A
//! [`PipeTap`] keeps access to the bytes in flight after the end itself has
//! been boxed into a record layer, so tests can corrupt them.

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use bytes::{Bytes, BytesMut};
use usocks::{backend::BackendStream, nonblocking::Received};

#[derive(Default)]
struct Channel {
    data: BytesMut,
    closed: bool,
    waker: Option<Waker>,
}

impl Channel {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

fn lock(channel: &Mutex<Channel>) -> MutexGuard<'_, Channel> {
    channel.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One side of an in-memory transport.
pub struct PipeEnd {
    inbound: Arc<Mutex<Channel>>,
    outbound: Arc<Mutex<Channel>>,
    output: BytesMut,
    write_limit: Option<usize>,
    address: String,
    closed: bool,
}

/// Create two connected ends labelled `"pipe-a"` and `"pipe-b"`.
#[must_use]
pub fn pipe() -> (PipeEnd, PipeEnd) {
    let ab = Arc::new(Mutex::new(Channel::default()));
    let ba = Arc::new(Mutex::new(Channel::default()));
    let end = |inbound: &Arc<Mutex<Channel>>, outbound: &Arc<Mutex<Channel>>, address: &str| PipeEnd {
        inbound: Arc::clone(inbound),
        outbound: Arc::clone(outbound),
        output: BytesMut::new(),
        write_limit: None,
        address: address.to_owned(),
        closed: false,
    };
    (end(&ba, &ab, "pipe-a"), end(&ab, &ba, "pipe-b"))
}

impl PipeEnd {
    /// Move at most `limit` bytes per flush, leaving the rest queued.
    #[must_use]
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Handle on the bytes waiting to be read by this end.
    #[must_use]
    pub fn tap(&self) -> PipeTap { PipeTap(Arc::clone(&self.inbound)) }

    /// Number of bytes written but not yet flushed to the other end.
    #[must_use]
    pub fn queued(&self) -> usize { self.output.len() }
}

impl BackendStream for PipeEnd {
    fn address(&self) -> &str { &self.address }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inbound = lock(&self.inbound);
        if inbound.data.is_empty() && !inbound.closed {
            inbound.waker = Some(cx.waker().clone());
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_write_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> { Poll::Ready(Ok(())) }

    fn recv(&mut self) -> io::Result<Received> {
        let mut inbound = lock(&self.inbound);
        if !inbound.data.is_empty() {
            Ok(Received::Data(inbound.data.split().freeze()))
        } else if inbound.closed {
            Ok(Received::Eof)
        } else {
            Ok(Received::Empty)
        }
    }

    fn send(&mut self, data: &[u8], urgent: bool) -> io::Result<bool> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.output.extend_from_slice(data);
        if urgent {
            self.flush()
        } else {
            Ok(self.output.is_empty())
        }
    }

    fn flush(&mut self) -> io::Result<bool> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let n = self
            .write_limit
            .map_or(self.output.len(), |limit| limit.min(self.output.len()));
        let mut outbound = lock(&self.outbound);
        if outbound.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        outbound.data.extend_from_slice(&self.output.split_to(n));
        outbound.wake();
        Ok(self.output.is_empty())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut outbound = lock(&self.outbound);
        let rest = self.output.split();
        outbound.data.extend_from_slice(&rest);
        outbound.closed = true;
        outbound.wake();
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) { self.close(); }
}

/// Access to the bytes a [`PipeEnd`] has yet to read.
#[derive(Clone)]
pub struct PipeTap(Arc<Mutex<Channel>>);

impl PipeTap {
    /// Number of bytes waiting.
    #[must_use]
    pub fn len(&self) -> usize { lock(&self.0).data.len() }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Whether the writing end has closed.
    #[must_use]
    pub fn writer_closed(&self) -> bool { lock(&self.0).closed }

    /// Invert every bit of the waiting byte at `index`.
    ///
    /// Returns `false` if fewer than `index + 1` bytes are waiting.
    pub fn flip(&self, index: usize) -> bool {
        lock(&self.0).data.get_mut(index).map(|byte| *byte = !*byte).is_some()
    }

    /// Remove and return every waiting byte.
    #[must_use]
    pub fn take(&self) -> Bytes { lock(&self.0).data.split().freeze() }

    /// Append `data` as if the writing end had sent it.
    pub fn inject(&self, data: &[u8]) {
        let mut channel = lock(&self.0);
        channel.data.extend_from_slice(data);
        channel.wake();
    }

    /// Overwrite the waiting byte at `index`.
    ///
    /// Returns `false` if fewer than `index + 1` bytes are waiting.
    pub fn set(&self, index: usize, value: u8) -> bool {
        lock(&self.0).data.get_mut(index).map(|byte| *byte = value).is_some()
    }
}
