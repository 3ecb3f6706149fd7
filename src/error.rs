//! Crate-wide error type.
//!
//! Each module reports failures through its own enum; [`Error`] gathers
//! them for callers that do not care which layer failed.

use thiserror::Error;

use crate::{
    backend::BackendError,
    client::ClientError,
    config::ConfigError,
    frontend::FrontendError,
    mux::MuxError,
    record::RecordError,
    registry::RegistryError,
    server::ServerError,
    tunnel::PacketError,
};

/// Any error produced by `usocks`.
#[derive(Debug, Error)]
pub enum Error {
    /// A multiplex packet could not be decoded.
    #[error(transparent)]
    Packet(#[from] PacketError),
    /// A registry lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A record layer failed.
    #[error(transparent)]
    Record(#[from] RecordError),
    /// A frontend failed.
    #[error(transparent)]
    Frontend(#[from] FrontendError),
    /// A backend could not be built.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Event dispatch found inconsistent state.
    #[error(transparent)]
    Mux(#[from] MuxError),
    /// The server failed to start.
    #[error(transparent)]
    Server(#[from] ServerError),
    /// The client failed to start.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Result alias using the crate [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_module_errors_transparently() {
        let err = Error::from(PacketError::UnsupportedVersion(9));
        assert_eq!(err.to_string(), PacketError::UnsupportedVersion(9).to_string());
        assert!(matches!(Error::from(ConfigError::EmptyKey("server")), Error::Config(_)));
    }

    #[test]
    fn client_setup_failures_keep_their_message() {
        let inner = ClientError::from(BackendError::UnknownType("carrier-pigeon".into()));
        let message = inner.to_string();
        let err = Error::from(inner);
        assert!(matches!(err, Error::Client(_)));
        assert_eq!(err.to_string(), message);
    }
}
