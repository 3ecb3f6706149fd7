//! One TCP connection per record layer.

use std::{
    io,
    net::SocketAddr,
    task::{Context, Poll, ready},
};

use futures::{FutureExt, future::BoxFuture};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use super::{
    Backend, BackendError, BackendStream, DEFAULT_PORT, bind_listener, connect_failed, parse_options,
};
use crate::nonblocking::{READ_CHUNK, Received, SendBuffer, try_recv};

pub(super) const NAME: &str = "plain_tcp";

/// Options accepted by the `plain_tcp` backend.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlainTcpOptions {
    /// Interface to listen on.
    pub address: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for PlainTcpOptions {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
        }
    }
}

/// Options accepted by the client side of `plain_tcp`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlainTcpClientOptions {
    /// Host running the server.
    pub server: String,
    /// Port the server listens on.
    pub port: u16,
}

impl Default for PlainTcpClientOptions {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".into(),
            port: DEFAULT_PORT,
        }
    }
}

pub(super) fn build(options: &toml::Table) -> Result<Box<dyn Backend>, BackendError> {
    let options: PlainTcpOptions = parse_options(NAME, options)?;
    Ok(Box::new(PlainTcpBackend::bind(&options)?))
}

pub(super) fn connect(
    options: &toml::Table,
) -> BoxFuture<'static, Result<Box<dyn BackendStream>, BackendError>> {
    let options: Result<PlainTcpClientOptions, _> = parse_options(NAME, options);
    async move {
        let options = options?;
        let stream = PlainTcpStream::connect((options.server.as_str(), options.port))
            .await
            .map_err(connect_failed(&options.server, options.port))?;
        Ok::<Box<dyn BackendStream>, BackendError>(Box::new(stream))
    }
    .boxed()
}

/// Listener handing out one [`PlainTcpStream`] per accepted socket.
#[derive(Debug)]
pub struct PlainTcpBackend {
    listener: Option<TcpListener>,
}

impl PlainTcpBackend {
    /// Bind a listener according to `options`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the error raised while binding.
    pub fn bind(options: &PlainTcpOptions) -> io::Result<Self> {
        Ok(Self::from_listener(bind_listener(&options.address, options.port)?))
    }

    /// Wrap an already bound listener.
    #[must_use]
    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener: Some(listener),
        }
    }
}

impl Backend for PlainTcpBackend {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Box<dyn BackendStream>>> {
        let Some(listener) = &self.listener else {
            return Poll::Pending;
        };
        let (stream, peer) = ready!(listener.poll_accept(cx))?;
        stream.set_nodelay(true)?;
        Poll::Ready(Ok(Box::new(PlainTcpStream::new(stream, peer.to_string()))))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn close(&mut self) { self.listener = None; }
}

/// A single non-blocking TCP stream with buffered output.
#[derive(Debug)]
pub struct PlainTcpStream {
    stream: Option<TcpStream>,
    address: String,
    output: SendBuffer,
}

impl PlainTcpStream {
    /// Wrap a connected stream; `address` labels it in logs.
    #[must_use]
    pub fn new(stream: TcpStream, address: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            address: address.into(),
            output: SendBuffer::new(),
        }
    }

    /// Connect to a server running a TCP backend.
    ///
    /// # Errors
    ///
    /// Returns the error raised while resolving or connecting.
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let address = stream.peer_addr()?.to_string();
        Ok(Self::new(stream, address))
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl BackendStream for PlainTcpStream {
    fn address(&self) -> &str { &self.address }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.stream {
            Some(stream) => stream.poll_read_ready(cx),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.stream {
            Some(stream) => stream.poll_write_ready(cx),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn recv(&mut self) -> io::Result<Received> { try_recv(self.stream()?, READ_CHUNK) }

    fn send(&mut self, data: &[u8], urgent: bool) -> io::Result<bool> {
        self.output.push(data);
        if urgent {
            self.flush()
        } else {
            Ok(self.output.is_empty())
        }
    }

    fn flush(&mut self) -> io::Result<bool> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        self.output.flush_to(stream)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Best effort: whatever the socket refuses now is dropped.
            let _ = self.output.flush_to(&stream);
        }
        self.output.clear();
    }
}
