//! The tunnel server: one backend, one frontend factory, one event loop.
//!
//! [`TunnelServer`] accepts record-layer connections from its backend and
//! drives every record layer and virtual connection from a single task.
//! See [`TunnelServer::run_with_shutdown`] for the loop itself.

mod backoff;
mod error;
mod runtime;

use std::{io, net::SocketAddr};

pub use backoff::BackoffConfig;
pub use error::ServerError;
pub(crate) use runtime::shutdown_signal;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{self, Backend},
    config::ServerConfig,
    frontend::{self, FrontendFactory},
    mux::Multiplexer,
    record::PresharedKey,
};

/// Tunnel-multiplexing server.
///
/// ```no_run
/// use std::path::Path;
///
/// use usocks::{config::Config, server::TunnelServer};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (config, _) = Config::load(Some(Path::new("config.toml")))?;
/// let server = TunnelServer::from_config(&config.server)?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct TunnelServer {
    backend: Box<dyn Backend>,
    key: PresharedKey,
    mux: Multiplexer,
    backoff: BackoffConfig,
    shutdown: CancellationToken,
}

impl TunnelServer {
    /// Create a server from already constructed parts.
    #[must_use]
    pub fn new(backend: Box<dyn Backend>, key: PresharedKey, factory: FrontendFactory) -> Self {
        Self {
            backend,
            key,
            mux: Multiplexer::new(factory),
            backoff: BackoffConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the backend and frontend named in `config`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if either plugin cannot be constructed.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let backend = backend::build(&config.backend.kind, &config.backend.options)?;
        let factory = frontend::build_factory(&config.frontend.kind, &config.frontend.options)?;
        Ok(Self::new(backend, config.preshared_key(), factory))
    }

    /// Configure the pause applied after failed accepts.
    #[must_use]
    pub fn accept_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff.normalized();
        self
    }

    /// Address the backend listens on.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.backend.local_addr() }

    /// Token that stops the event loop when cancelled.
    ///
    /// The loop checks it once per iteration, before waiting for events.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }
}
