//! Errors raised by [`TunnelServer`](super::TunnelServer) setup.

use std::io;

use thiserror::Error;

use crate::{backend::BackendError, frontend::FrontendError};

/// Errors that stop the server before its loop starts.
///
/// Failures while the loop runs are logged and never surface here.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured backend could not be built.
    #[error("backend setup failed: {0}")]
    Backend(#[from] BackendError),
    /// The configured frontend could not be built.
    #[error("frontend setup failed: {0}")]
    Frontend(#[from] FrontendError),
    /// Installing the signal handlers failed.
    #[error("cannot install signal handler: {0}")]
    Signal(#[source] io::Error),
}
