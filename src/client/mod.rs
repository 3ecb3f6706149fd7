//! The tunnel client: local connections carried to a server over one
//! record layer.
//!
//! [`TunnelClient`] listens on a local port and opens a virtual connection
//! for every connection it accepts there. The server forwards each one to
//! its frontend. Like the server, everything runs on a single task; see
//! [`TunnelClient::run_with_shutdown`].

mod error;
mod pool;
mod runtime;
mod session;

use std::{io, net::SocketAddr};

pub use error::ClientError;
pub use pool::ConnIdPool;
pub use session::{ClientSession, Endpoint};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{self, BackendStream},
    config::ClientConfig,
    record::{PresharedKey, RecordConnection, RecordLayer},
    server::BackoffConfig,
};

/// Tunnel client.
///
/// ```no_run
/// use std::path::Path;
///
/// use usocks::{client::TunnelClient, config::ClientFile};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (file, _) = ClientFile::load(Some(Path::new("config.toml")))?;
/// let client = TunnelClient::connect(&file.client).await?;
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct TunnelClient {
    listener: TcpListener,
    session: ClientSession,
    backoff: BackoffConfig,
    shutdown: CancellationToken,
}

impl TunnelClient {
    /// Create a client from a bound listener and an established record
    /// layer.
    #[must_use]
    pub fn new(listener: TcpListener, record: Box<dyn RecordLayer>) -> Self {
        Self {
            listener,
            session: ClientSession::new(record),
            backoff: BackoffConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the local port, dial the server and wait for its salt.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Bind`] if the local port is unavailable,
    /// [`ClientError::Backend`] if the server cannot be reached, or
    /// [`ClientError::Handshake`] if the record layer fails to start.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ClientError::Bind {
                addr: config.listen,
                source,
            })?;
        let stream = backend::connect(&config.backend.kind, &config.backend.options).await?;
        Self::establish(listener, config.preshared_key(), stream).await
    }

    /// Start the record layer over `stream` and wait until it is keyed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handshake`] if the salt exchange fails.
    pub async fn establish(
        listener: TcpListener,
        key: PresharedKey,
        stream: Box<dyn BackendStream>,
    ) -> Result<Self, ClientError> {
        let mut record = RecordConnection::new(key, stream)?;
        let early = record.handshake().await?;
        let mut client = Self::new(listener, Box::new(record));
        client.session.apply_batch(early);
        Ok(client)
    }

    /// Configure the pause applied after failed accepts.
    #[must_use]
    pub fn accept_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff.normalized();
        self
    }

    /// Address accepting local connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.listener.local_addr() }

    /// Token that stops the event loop when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }
}
