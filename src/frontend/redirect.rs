//! Frontend forwarding every virtual connection to one fixed TCP target.

use std::{
    io,
    net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs},
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use serde::Deserialize;
use socket2::SockRef;
use tokio::net::TcpStream;

use super::{Frontend, FrontendError, FrontendFactory, parse_options};
use crate::nonblocking::{READ_CHUNK, Received, SendBuffer, try_recv};

pub(super) const NAME: &str = "redirect";

/// Options accepted by the `redirect` frontend.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RedirectOptions {
    /// Host to connect to.
    pub server: String,
    /// Port to connect to.
    pub port: u16,
    /// Upper bound on each connection attempt, in milliseconds.
    ///
    /// Resolution and connecting run synchronously on the event loop, so
    /// the whole server stalls while a connection is attempted: up to this
    /// long for every address the target resolves to. Keep it short when
    /// the target may be unreachable.
    pub connect_timeout_ms: u64,
}

impl Default for RedirectOptions {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: 80,
            connect_timeout_ms: 5000,
        }
    }
}

pub(super) fn factory(options: &toml::Table) -> Result<FrontendFactory, FrontendError> {
    let options: RedirectOptions = parse_options(NAME, options)?;
    Ok(Arc::new(move || {
        let frontend: Box<dyn Frontend> = Box::new(TcpFrontend::connect(&options)?);
        Ok(frontend)
    }))
}

/// A TCP connection used as a frontend: the redirect target on the server,
/// or an accepted local connection on the client.
#[derive(Debug)]
pub struct TcpFrontend {
    stream: Option<TcpStream>,
    output: SendBuffer,
}

impl TcpFrontend {
    /// Connect to the configured target.
    ///
    /// The connection attempt blocks the calling thread, and with it the
    /// event loop, for at most `connect_timeout_ms` per resolved address.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Unavailable`] if the target cannot be
    /// resolved or reached, or [`FrontendError::Io`] if the connected socket
    /// cannot be registered with the runtime.
    pub fn connect(options: &RedirectOptions) -> Result<Self, FrontendError> {
        let target = format!("{}:{}", options.server, options.port);
        let timeout = Duration::from_millis(options.connect_timeout_ms.max(1));
        let addrs: Vec<SocketAddr> = (options.server.as_str(), options.port)
            .to_socket_addrs()
            .map_err(|e| FrontendError::Unavailable(format!("cannot resolve {target}: {e}")))?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match StdTcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(Self::from_std(stream)?),
                Err(e) => last_error = Some(e),
            }
        }
        Err(FrontendError::Unavailable(match last_error {
            Some(e) => format!("connection to {target} failed: {e}"),
            None => format!("{target} resolved to no addresses"),
        }))
    }

    /// Wrap a connection that is already established.
    ///
    /// # Errors
    ///
    /// Returns the error raised while configuring the socket.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Some(stream),
            output: SendBuffer::new(),
        })
    }

    fn from_std(stream: StdTcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Self::from_stream(TcpStream::from_std(stream)?)
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl Frontend for TcpFrontend {
    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.stream {
            Some(stream) => stream.poll_read_ready(cx),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.stream {
            _ if self.output.is_empty() => Poll::Ready(Ok(())),
            Some(stream) => stream.poll_write_ready(cx),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn recv(&mut self) -> Result<Received, FrontendError> {
        Ok(try_recv(self.stream()?, READ_CHUNK)?)
    }

    fn send(&mut self, data: &[u8]) -> Result<bool, FrontendError> {
        self.output.push(data);
        self.flush()
    }

    fn flush(&mut self) -> Result<bool, FrontendError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        Ok(self.output.flush_to(stream)?)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = self.output.flush_to(&stream);
        }
        self.output.clear();
    }

    fn reset(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Zero linger turns the close into a RST.
            let _ = SockRef::from(&stream).set_linger(Some(Duration::ZERO));
        }
        self.output.clear();
    }
}
