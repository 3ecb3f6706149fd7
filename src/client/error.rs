//! Errors raised by [`TunnelClient`](super::TunnelClient) setup.

use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{backend::BackendError, record::RecordError};

/// Errors that stop the client before its loop starts.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport to the server could not be opened.
    #[error("backend setup failed: {0}")]
    Backend(#[from] BackendError),
    /// The local port could not be bound.
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        /// Requested local address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The record layer failed before the server's salt arrived.
    #[error("record layer handshake failed: {0}")]
    Handshake(#[from] RecordError),
    /// Installing the signal handlers failed.
    #[error("cannot install signal handler: {0}")]
    Signal(#[source] io::Error),
}
