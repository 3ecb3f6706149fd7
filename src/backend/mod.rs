//! Transports that yield record-layer connections.
//!
//! A [`Backend`] accepts raw peer connections; each one is handed out as a
//! [`BackendStream`] which the record layer frames and encrypts. Concrete
//! backends are looked up by name from a static catalogue so the server
//! never depends on a concrete transport type. The same names resolve the
//! client side of each transport through [`connect`].

mod multi_tcp;
mod plain_tcp;

use std::{
    io,
    net::SocketAddr,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
pub use multi_tcp::{MultiTcpBackend, MultiTcpClientOptions, MultiTcpOptions, MultiTcpStream};
pub use plain_tcp::{PlainTcpBackend, PlainTcpClientOptions, PlainTcpOptions, PlainTcpStream};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::nonblocking::Received;

/// Default port shared by the TCP backends.
pub const DEFAULT_PORT: u16 = 4194;

/// Source of new record-layer transports.
pub trait Backend: Send {
    /// Poll for the next fully established transport.
    ///
    /// A pending incoming connection counts as read readiness; the
    /// implementation accepts it and returns the wrapped stream.
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Box<dyn BackendStream>>>;

    /// Address the backend listens on.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend has been closed.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Stop accepting connections.
    fn close(&mut self);
}

/// One accepted transport carrying a record layer.
pub trait BackendStream: Send {
    /// Peer address used in diagnostics.
    fn address(&self) -> &str;

    /// Poll until a read would make progress.
    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Poll until queued output can be written.
    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Read whatever is available without blocking.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn recv(&mut self) -> io::Result<Received>;

    /// Queue `data`; when `urgent` also try to write everything queued.
    ///
    /// Returns `true` when no output is left queued.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn send(&mut self, data: &[u8], urgent: bool) -> io::Result<bool>;

    /// Retry writing queued output. Returns `true` once drained.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn flush(&mut self) -> io::Result<bool>;

    /// Close the transport, flushing queued output best-effort.
    fn close(&mut self);
}

/// Errors raised while constructing a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No backend is registered under the requested type name.
    #[error("unknown backend type `{0}`")]
    UnknownType(String),
    /// The options table did not match the backend's schema.
    #[error("invalid options for backend `{kind}`: {source}")]
    Options {
        /// Backend type name.
        kind: &'static str,
        /// Deserialisation failure.
        #[source]
        source: toml::de::Error,
    },
    /// An option had an unusable value.
    #[error("invalid options for backend `{kind}`: {reason}")]
    InvalidOption {
        /// Backend type name.
        kind: &'static str,
        /// What was wrong.
        reason: String,
    },
    /// Binding the listening socket failed.
    #[error("failed to bind backend listener: {0}")]
    Bind(#[from] io::Error),
    /// Connecting to a server failed.
    #[error("cannot connect to {target}: {source}")]
    Connect {
        /// `host:port` that was dialled.
        target: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Constructor registered for a backend type name.
pub type BackendConstructor = fn(&toml::Table) -> Result<Box<dyn Backend>, BackendError>;

const CATALOGUE: &[(&str, BackendConstructor)] = &[
    (plain_tcp::NAME, plain_tcp::build),
    (multi_tcp::NAME, multi_tcp::build),
];

/// Names of every available backend type.
pub fn available() -> impl Iterator<Item = &'static str> { CATALOGUE.iter().map(|(name, _)| *name) }

/// Resolve the constructor registered for `kind`.
#[must_use]
pub fn constructor(kind: &str) -> Option<BackendConstructor> {
    CATALOGUE
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, ctor)| *ctor)
}

/// Construct the backend named `kind` from its options table.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns [`BackendError::UnknownType`] for an unregistered name, or the
/// constructor's own error.
pub fn build(kind: &str, options: &toml::Table) -> Result<Box<dyn Backend>, BackendError> {
    let ctor = constructor(kind).ok_or_else(|| BackendError::UnknownType(kind.to_owned()))?;
    ctor(options)
}

/// Client-side constructor registered for a backend type name.
pub type BackendConnector =
    fn(&toml::Table) -> BoxFuture<'static, Result<Box<dyn BackendStream>, BackendError>>;

const CONNECTORS: &[(&str, BackendConnector)] = &[
    (plain_tcp::NAME, plain_tcp::connect),
    (multi_tcp::NAME, multi_tcp::connect),
];

/// Resolve the client-side constructor registered for `kind`.
#[must_use]
pub fn connector(kind: &str) -> Option<BackendConnector> {
    CONNECTORS
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, ctor)| *ctor)
}

/// Open the client side of the transport named `kind`.
///
/// # Errors
///
/// Returns [`BackendError::UnknownType`] for an unregistered name,
/// [`BackendError::Options`] or [`BackendError::InvalidOption`] for bad
/// options, or [`BackendError::Connect`] if the server cannot be reached.
pub async fn connect(
    kind: &str,
    options: &toml::Table,
) -> Result<Box<dyn BackendStream>, BackendError> {
    let ctor = connector(kind).ok_or_else(|| BackendError::UnknownType(kind.to_owned()))?;
    ctor(options).await
}

fn connect_failed(server: &str, port: u16) -> impl FnOnce(io::Error) -> BackendError {
    let target = format!("{server}:{port}");
    move |source| BackendError::Connect { target, source }
}

fn parse_options<T: DeserializeOwned>(
    kind: &'static str,
    options: &toml::Table,
) -> Result<T, BackendError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|source| BackendError::Options { kind, source })
}

fn bind_listener(address: &str, port: u16) -> io::Result<tokio::net::TcpListener> {
    let listener = std::net::TcpListener::bind((address, port))?;
    listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_lists_tcp_backends() {
        let names: Vec<_> = available().collect();
        assert_eq!(names, vec!["plain_tcp", "multi_tcp"]);
        assert!(constructor("plain_tcp").is_some());
    }

    #[test]
    fn every_backend_has_a_client_side() {
        for name in available() {
            assert!(connector(name).is_some(), "{name} cannot connect");
        }
    }

    #[tokio::test]
    async fn unknown_connector_is_rejected() {
        let err = connect("carrier_pigeon", &toml::Table::new())
            .await
            .err()
            .expect("unknown type must fail");
        assert!(matches!(err, BackendError::UnknownType(_)));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = build("carrier_pigeon", &toml::Table::new())
            .err()
            .expect("unknown type must fail");
        assert!(matches!(err, BackendError::UnknownType(ref name) if name == "carrier_pigeon"));
    }

    #[test]
    fn mistyped_options_are_reported() {
        let mut options = toml::Table::new();
        options.insert("port".into(), toml::Value::String("not a port".into()));
        let err = build("plain_tcp", &options)
            .err()
            .expect("invalid options must fail");
        assert!(matches!(err, BackendError::Options { kind: "plain_tcp", .. }));
    }
}
