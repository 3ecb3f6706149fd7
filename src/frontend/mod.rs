//! Endpoints that virtual connections are forwarded to.
//!
//! Every virtual connection opened by a peer is backed by one [`Frontend`]
//! produced by a [`FrontendFactory`]. Factories are built once at startup
//! from a type name and an options table.

mod redirect;

use std::{
    io,
    sync::Arc,
    task::{Context, Poll},
};

pub use redirect::{RedirectOptions, TcpFrontend};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::nonblocking::Received;

/// One endpoint backing a virtual connection.
pub trait Frontend: Send {
    /// Poll until [`recv`](Self::recv) would make progress.
    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Poll until buffered output can be flushed.
    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Read whatever the endpoint has produced.
    ///
    /// # Errors
    ///
    /// Any error is fatal to this virtual connection.
    fn recv(&mut self) -> Result<Received, FrontendError>;

    /// Queue `data` and try to flush. Returns `true` once fully written.
    ///
    /// # Errors
    ///
    /// Any error is fatal to this virtual connection.
    fn send(&mut self, data: &[u8]) -> Result<bool, FrontendError>;

    /// Retry writing buffered output. Returns `true` once drained.
    ///
    /// # Errors
    ///
    /// Any error is fatal to this virtual connection.
    fn flush(&mut self) -> Result<bool, FrontendError>;

    /// Close gracefully.
    fn close(&mut self);

    /// Abort, signalling the failure to the endpoint where possible.
    fn reset(&mut self);
}

/// Errors raised by frontends and their factories.
#[derive(Debug, Error)]
pub enum FrontendError {
    /// The factory could not produce a frontend for a new connection.
    #[error("frontend unavailable: {0}")]
    Unavailable(String),
    /// The endpoint failed after it was opened.
    #[error("frontend I/O failed: {0}")]
    Io(#[from] io::Error),
    /// No frontend is registered under the requested type name.
    #[error("unknown frontend type `{0}`")]
    UnknownType(String),
    /// The options table did not match the frontend's schema.
    #[error("invalid options for frontend `{kind}`: {source}")]
    Options {
        /// Frontend type name.
        kind: &'static str,
        /// Deserialisation failure.
        #[source]
        source: toml::de::Error,
    },
}

/// Shareable constructor invoked once per opened virtual connection.
pub type FrontendFactory = Arc<dyn Fn() -> Result<Box<dyn Frontend>, FrontendError> + Send + Sync>;

type FactoryBuilder = fn(&toml::Table) -> Result<FrontendFactory, FrontendError>;

const CATALOGUE: &[(&str, FactoryBuilder)] = &[(redirect::NAME, redirect::factory)];

/// Names of every available frontend type.
pub fn available() -> impl Iterator<Item = &'static str> { CATALOGUE.iter().map(|(name, _)| *name) }

/// Build the factory for frontend type `kind`.
///
/// # Errors
///
/// Returns [`FrontendError::UnknownType`] for an unregistered name or
/// [`FrontendError::Options`] when `options` do not fit the type.
pub fn build_factory(kind: &str, options: &toml::Table) -> Result<FrontendFactory, FrontendError> {
    let (_, builder) = CATALOGUE
        .iter()
        .find(|(name, _)| *name == kind)
        .ok_or_else(|| FrontendError::UnknownType(kind.to_owned()))?;
    builder(options)
}

fn parse_options<T: DeserializeOwned>(
    kind: &'static str,
    options: &toml::Table,
) -> Result<T, FrontendError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|source| FrontendError::Options { kind, source })
}
