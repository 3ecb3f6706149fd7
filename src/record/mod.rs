//! Authenticated framing between the server and a tunnel peer.
//!
//! A record layer turns one [`BackendStream`](crate::backend::BackendStream)
//! into a sequence of opaque packets. The multiplexer only sees the
//! [`RecordLayer`] trait; [`RecordConnection`] is the concrete
//! implementation used in production.

mod cipher;
mod connection;
mod header;

use std::{
    io,
    task::{Context, Poll},
};

use bytes::Bytes;
pub use cipher::{PresharedKey, SALT_LEN, TAG_LEN};
pub use connection::RecordConnection;
pub use header::{HEADER_LEN, MAX_RECORD_DATA, RecordType};
use thiserror::Error;

/// Packet-oriented channel to one peer.
pub trait RecordLayer: Send {
    /// Peer address used in diagnostics.
    fn address(&self) -> &str;

    /// Poll until [`receive_packets`](Self::receive_packets) would make
    /// progress.
    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Poll until [`continue_sending`](Self::continue_sending) would make
    /// progress.
    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Read and decode every complete packet currently available.
    ///
    /// Returns `Ok(None)` once the peer has closed the channel cleanly and
    /// an empty batch when nothing complete has arrived yet.
    ///
    /// # Errors
    ///
    /// Returns a [`RecordError`] describing why the channel is unusable.
    fn receive_packets(&mut self) -> Result<Option<Vec<Bytes>>, RecordError>;

    /// Queue `packet` and try to flush. Returns `true` once fully sent.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Transport`] if the transport failed.
    fn send_packet(&mut self, packet: &[u8]) -> Result<bool, RecordError>;

    /// Retry a partially flushed send. Returns `true` once fully sent.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Transport`] if the transport failed.
    fn continue_sending(&mut self) -> Result<bool, RecordError>;

    /// Notify the peer that the channel is closing.
    ///
    /// The transport stays open; see [`close_transport`](Self::close_transport).
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Transport`] if the notification could not be
    /// queued.
    fn close(&mut self) -> Result<(), RecordError>;

    /// Close the underlying transport.
    fn close_transport(&mut self);
}

/// Reasons a record layer becomes unusable.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A record failed authentication.
    #[error("record authentication failed")]
    HashFailure,
    /// A record header was inconsistent or of an unknown type.
    #[error("invalid record header")]
    InvalidHeader,
    /// The peer sent a reset record.
    #[error("remote peer reset the record layer")]
    RemoteReset,
    /// The transport ended before a close record arrived.
    #[error("transport closed without a close record")]
    InsecureClosing,
    /// The underlying transport failed.
    #[error("record transport failed: {0}")]
    Transport(#[from] io::Error),
}

impl RecordError {
    /// Tag identifying the error category.
    #[must_use]
    pub fn kind(&self) -> RecordErrorKind {
        match self {
            Self::HashFailure => RecordErrorKind::HashFailure,
            Self::InvalidHeader => RecordErrorKind::InvalidHeader,
            Self::RemoteReset => RecordErrorKind::RemoteReset,
            Self::InsecureClosing => RecordErrorKind::InsecureClosing,
            Self::Transport(_) => RecordErrorKind::Transport,
        }
    }
}

/// Category of a [`RecordError`], matched on instead of the error itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordErrorKind {
    /// See [`RecordError::HashFailure`].
    HashFailure,
    /// See [`RecordError::InvalidHeader`].
    InvalidHeader,
    /// See [`RecordError::RemoteReset`].
    RemoteReset,
    /// See [`RecordError::InsecureClosing`].
    InsecureClosing,
    /// See [`RecordError::Transport`].
    Transport,
}

impl RecordErrorKind {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HashFailure => "hash_failure",
            Self::InvalidHeader => "invalid_header",
            Self::RemoteReset => "remote_reset",
            Self::InsecureClosing => "insecure_closing",
            Self::Transport => "transport",
        }
    }

    /// Human readable description for log lines.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::HashFailure => "hash failure, the connection may be under attack",
            Self::InvalidHeader => "invalid header, the connection may be under attack",
            Self::RemoteReset => "reset by remote peer",
            Self::InsecureClosing => "insecure closing",
            Self::Transport => "transport failure",
        }
    }

    /// Whether the peer should be sent a reset record.
    #[must_use]
    pub fn warrants_reset(self) -> bool { matches!(self, Self::HashFailure | Self::InvalidHeader) }
}
