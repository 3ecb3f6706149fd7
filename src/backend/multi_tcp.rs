//! One record layer striped across several TCP connections.
//!
//! The peer opens `number` connections from the same address. Output is
//! cut into `blocksize` chunks written to the connections in turn, and
//! input is read back in the same round-robin order. A group that has not
//! filled up within `group_timeout_ms` is dropped.

use std::{
    collections::HashMap,
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use serde::Deserialize;
use tokio::{
    net::{TcpListener, TcpStream},
    time::{Instant, Sleep, sleep_until},
};
use tracing::debug;

use super::{
    Backend, BackendError, BackendStream, DEFAULT_PORT, bind_listener, connect_failed, parse_options,
};
use crate::nonblocking::{Received, SendBuffer, try_recv};

pub(super) const NAME: &str = "multi_tcp";

/// Options accepted by the `multi_tcp` backend.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MultiTcpOptions {
    /// Interface to listen on.
    pub address: String,
    /// Port to listen on.
    pub port: u16,
    /// Connections making up one record layer.
    pub number: usize,
    /// Bytes written to one connection before moving to the next.
    pub blocksize: usize,
    /// Milliseconds a peer has to open all `number` connections.
    pub group_timeout_ms: u64,
}

impl Default for MultiTcpOptions {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            number: 5,
            blocksize: 8192,
            group_timeout_ms: 10_000,
        }
    }
}

/// Options accepted by the client side of `multi_tcp`.
///
/// `number` and `blocksize` must match the server's.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MultiTcpClientOptions {
    /// Host running the server.
    pub server: String,
    /// Port the server listens on.
    pub port: u16,
    /// Connections to open.
    pub number: usize,
    /// Bytes written to one connection before moving to the next.
    pub blocksize: usize,
}

impl Default for MultiTcpClientOptions {
    fn default() -> Self {
        let server = MultiTcpOptions::default();
        Self {
            server: "127.0.0.1".into(),
            port: server.port,
            number: server.number,
            blocksize: server.blocksize,
        }
    }
}

pub(super) fn build(options: &toml::Table) -> Result<Box<dyn Backend>, BackendError> {
    let options: MultiTcpOptions = parse_options(NAME, options)?;
    Ok(Box::new(MultiTcpBackend::bind(&options)?))
}

pub(super) fn connect(
    options: &toml::Table,
) -> BoxFuture<'static, Result<Box<dyn BackendStream>, BackendError>> {
    let options: Result<MultiTcpClientOptions, _> = parse_options(NAME, options);
    async move {
        let stream = MultiTcpStream::connect(&options?).await?;
        Ok::<Box<dyn BackendStream>, BackendError>(Box::new(stream))
    }
    .boxed()
}

/// Listener that groups connections by peer address.
#[derive(Debug)]
pub struct MultiTcpBackend {
    listener: Option<TcpListener>,
    number: usize,
    blocksize: usize,
    group_timeout: Duration,
    waiting: HashMap<IpAddr, Group>,
    /// Fires at the earliest group deadline.
    expiry: Option<Pin<Box<Sleep>>>,
}

/// Connections from one address still waiting for the rest of the group.
#[derive(Debug)]
struct Group {
    deadline: Instant,
    streams: Vec<TcpStream>,
}

impl MultiTcpBackend {
    /// Bind a listener according to `options`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidOption`] when `number`, `blocksize`
    /// or `group_timeout_ms` is zero, or the error raised while binding.
    pub fn bind(options: &MultiTcpOptions) -> Result<Self, BackendError> {
        if options.group_timeout_ms == 0 {
            return Err(BackendError::InvalidOption {
                kind: NAME,
                reason: "group_timeout_ms must be >= 1".into(),
            });
        }
        let listener = bind_listener(&options.address, options.port)?;
        Ok(Self::from_listener(listener, options.number, options.blocksize)?
            .with_group_timeout(Duration::from_millis(options.group_timeout_ms)))
    }

    /// Wrap an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidOption`] when `number` or `blocksize`
    /// is zero.
    pub fn from_listener(
        listener: TcpListener,
        number: usize,
        blocksize: usize,
    ) -> Result<Self, BackendError> {
        if number == 0 || blocksize == 0 {
            return Err(BackendError::InvalidOption {
                kind: NAME,
                reason: format!("number ({number}) and blocksize ({blocksize}) must be >= 1"),
            });
        }
        Ok(Self {
            listener: Some(listener),
            number,
            blocksize,
            group_timeout: Duration::from_millis(MultiTcpOptions::default().group_timeout_ms),
            waiting: HashMap::new(),
            expiry: None,
        })
    }

    /// Drop incomplete groups `timeout` after their first connection.
    #[must_use]
    pub fn with_group_timeout(mut self, timeout: Duration) -> Self {
        self.group_timeout = timeout;
        self
    }

    /// Drop groups past their deadline and arm the timer for the next one.
    fn expire_groups(&mut self, cx: &mut Context<'_>) {
        let now = Instant::now();
        self.waiting.retain(|ip, group| {
            let alive = group.deadline > now;
            if !alive {
                debug!(
                    layer = "record",
                    client = %ip,
                    connections = group.streams.len(),
                    "incomplete connection group expired"
                );
            }
            alive
        });
        let Some(next) = self.waiting.values().map(|group| group.deadline).min() else {
            self.expiry = None;
            return;
        };
        let timer = self.expiry.get_or_insert_with(|| Box::pin(sleep_until(next)));
        timer.as_mut().reset(next);
        if timer.as_mut().poll(cx).is_ready() {
            cx.waker().wake_by_ref();
        }
    }
}

impl Backend for MultiTcpBackend {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Box<dyn BackendStream>>> {
        loop {
            let Some(listener) = &self.listener else {
                return Poll::Pending;
            };
            let Poll::Ready(accepted) = listener.poll_accept(cx) else {
                self.expire_groups(cx);
                return Poll::Pending;
            };
            let (stream, peer) = accepted?;
            stream.set_nodelay(true)?;
            let ip = peer.ip();
            let deadline = Instant::now() + self.group_timeout;
            let group = self.waiting.entry(ip).or_insert_with(|| Group {
                deadline,
                streams: Vec::new(),
            });
            group.streams.push(stream);
            if group.streams.len() < self.number {
                continue;
            }
            if let Some(group) = self.waiting.remove(&ip) {
                let stream = MultiTcpStream::new(group.streams, ip.to_string(), self.blocksize);
                return Poll::Ready(Ok(Box::new(stream)));
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn close(&mut self) {
        self.listener = None;
        self.waiting.clear();
        self.expiry = None;
    }
}

/// Round-robin striped set of TCP connections.
#[derive(Debug)]
pub struct MultiTcpStream {
    streams: Vec<TcpStream>,
    outputs: Vec<SendBuffer>,
    address: String,
    blocksize: usize,
    filling: usize,
    filled: usize,
    receiving: usize,
    remaining: usize,
}

impl MultiTcpStream {
    /// Stripe over `streams`, which must be non-empty and in the order the
    /// peer uses.
    #[must_use]
    pub fn new(streams: Vec<TcpStream>, address: impl Into<String>, blocksize: usize) -> Self {
        let outputs = streams.iter().map(|_| SendBuffer::new()).collect();
        Self {
            streams,
            outputs,
            address: address.into(),
            blocksize,
            filling: 0,
            filled: 0,
            receiving: 0,
            remaining: blocksize,
        }
    }

    /// Open `number` connections to the server, one after another so the
    /// server groups them in the same order.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidOption`] when `number` or `blocksize`
    /// is zero, or [`BackendError::Connect`] if any connection fails.
    pub async fn connect(options: &MultiTcpClientOptions) -> Result<Self, BackendError> {
        if options.number == 0 || options.blocksize == 0 {
            return Err(BackendError::InvalidOption {
                kind: NAME,
                reason: format!(
                    "number ({}) and blocksize ({}) must be >= 1",
                    options.number, options.blocksize
                ),
            });
        }
        let failed = || connect_failed(&options.server, options.port);
        let mut streams = Vec::with_capacity(options.number);
        for _ in 0..options.number {
            let stream = TcpStream::connect((options.server.as_str(), options.port))
                .await
                .map_err(failed())?;
            stream.set_nodelay(true).map_err(failed())?;
            streams.push(stream);
        }
        let address = match streams.first().map(TcpStream::peer_addr) {
            Some(Ok(peer)) => peer.ip().to_string(),
            _ => options.server.clone(),
        };
        Ok(Self::new(streams, address, options.blocksize))
    }

    fn stripe(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = self.blocksize - self.filled;
            let take = room.min(data.len());
            self.outputs[self.filling].push(&data[..take]);
            data = &data[take..];
            if take == room {
                self.filling = (self.filling + 1) % self.outputs.len();
                self.filled = 0;
            } else {
                self.filled += take;
            }
        }
    }

    fn is_drained(&self) -> bool { self.outputs.iter().all(SendBuffer::is_empty) }
}

impl BackendStream for MultiTcpStream {
    fn address(&self) -> &str { &self.address }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.streams.get(self.receiving) {
            Some(stream) => stream.poll_read_ready(cx),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.is_drained() {
            return Poll::Ready(Ok(()));
        }
        for (stream, output) in self.streams.iter().zip(&self.outputs) {
            if !output.is_empty() && stream.poll_write_ready(cx).is_ready() {
                return Poll::Ready(Ok(()));
            }
        }
        Poll::Pending
    }

    fn recv(&mut self) -> io::Result<Received> {
        let stream = self
            .streams
            .get(self.receiving)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let received = try_recv(stream, self.remaining)?;
        if let Received::Data(data) = &received {
            self.remaining -= data.len();
            if self.remaining == 0 {
                self.receiving = (self.receiving + 1) % self.streams.len();
                self.remaining = self.blocksize;
            }
        }
        Ok(received)
    }

    fn send(&mut self, data: &[u8], urgent: bool) -> io::Result<bool> {
        self.stripe(data);
        if urgent {
            self.flush()
        } else {
            Ok(self.is_drained())
        }
    }

    fn flush(&mut self) -> io::Result<bool> {
        let mut complete = true;
        for (stream, output) in self.streams.iter().zip(self.outputs.iter_mut()) {
            if !output.flush_to(stream)? {
                complete = false;
            }
        }
        Ok(complete)
    }

    fn close(&mut self) {
        for (stream, output) in self.streams.iter().zip(self.outputs.iter_mut()) {
            let _ = output.flush_to(stream);
            output.clear();
        }
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use futures::future::poll_fn;
    use tokio::{io::AsyncReadExt, time::timeout};

    use super::*;

    async fn read_exact(stream: &mut MultiTcpStream, len: usize) -> BytesMut {
        let mut out = BytesMut::new();
        while out.len() < len {
            poll_fn(|cx| stream.poll_read_ready(cx)).await.expect("readable");
            match stream.recv().expect("recv") {
                Received::Data(data) => out.extend_from_slice(&data),
                Received::Empty => {}
                Received::Eof => panic!("unexpected eof"),
            }
        }
        out
    }

    #[tokio::test]
    async fn groups_connections_and_stripes_blocks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut backend = MultiTcpBackend::from_listener(listener, 2, 4).expect("valid options");
        let addr = backend.local_addr().expect("local address");

        let mut client_streams = Vec::new();
        for _ in 0..2 {
            let stream = TcpStream::connect(addr).await.expect("connect");
            // Accept in connect order so both sides agree on stripe order.
            client_streams.push(stream);
            tokio::task::yield_now().await;
        }
        let mut server = poll_fn(|cx| backend.poll_accept(cx)).await.expect("accept");
        assert_eq!(server.address(), "127.0.0.1");

        let mut client = MultiTcpStream::new(client_streams, addr.to_string(), 4);
        let payload = b"0123456789";
        let mut done = client.send(payload, true).expect("send");
        while !done {
            poll_fn(|cx| client.poll_write_ready(cx)).await.expect("writable");
            done = client.flush().expect("flush");
        }

        let mut received = BytesMut::new();
        while received.len() < payload.len() {
            poll_fn(|cx| server.poll_read_ready(cx)).await.expect("readable");
            if let Received::Data(data) = server.recv().expect("recv") {
                received.extend_from_slice(&data);
            }
        }
        assert_eq!(&received[..], payload);
    }

    #[tokio::test]
    async fn stripe_rotates_after_each_block() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local address");
        let a = TcpStream::connect(addr).await.expect("connect a");
        let (a_peer, _) = listener.accept().await.expect("accept a");
        let b = TcpStream::connect(addr).await.expect("connect b");
        let (b_peer, _) = listener.accept().await.expect("accept b");

        let mut striped = MultiTcpStream::new(vec![a, b], "peer", 3);
        let mut done = striped.send(b"abcdefgh", true).expect("send");
        while !done {
            poll_fn(|cx| striped.poll_write_ready(cx)).await.expect("writable");
            done = striped.flush().expect("flush");
        }

        let mut first = MultiTcpStream::new(vec![a_peer], "a", 64);
        let mut second = MultiTcpStream::new(vec![b_peer], "b", 64);
        assert_eq!(&read_exact(&mut first, 5).await[..], b"abcgh");
        assert_eq!(&read_exact(&mut second, 3).await[..], b"def");
    }

    #[test]
    fn zero_sized_groups_are_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            assert!(matches!(
                MultiTcpBackend::from_listener(listener, 0, 8),
                Err(BackendError::InvalidOption { kind: NAME, .. })
            ));
        });
    }

    #[tokio::test]
    async fn incomplete_groups_expire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut backend = MultiTcpBackend::from_listener(listener, 2, 4)
            .expect("valid options")
            .with_group_timeout(Duration::from_millis(50));
        let addr = backend.local_addr().expect("local address");

        let mut stale = TcpStream::connect(addr).await.expect("connect");
        while backend.waiting.is_empty() {
            poll_fn(|cx| {
                assert!(backend.poll_accept(cx).is_pending(), "a group of one was accepted");
                Poll::Ready(())
            })
            .await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The armed timer wakes the backend once the deadline passes.
        poll_fn(|cx| {
            if backend.poll_accept(cx).is_pending() && backend.waiting.is_empty() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), stale.read(&mut buf))
            .await
            .expect("stale connection was not dropped")
            .expect("read");
        assert_eq!(read, 0);

        let _first = TcpStream::connect(addr).await.expect("connect");
        let _second = TcpStream::connect(addr).await.expect("connect");
        let server = poll_fn(|cx| backend.poll_accept(cx)).await.expect("accept");
        assert_eq!(server.address(), "127.0.0.1");
    }

    #[tokio::test]
    async fn client_side_forms_a_group_the_server_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut backend = MultiTcpBackend::from_listener(listener, 3, 2).expect("valid options");
        let addr = backend.local_addr().expect("local address");
        let mut options = toml::Table::new();
        options.insert("server".into(), "127.0.0.1".into());
        options.insert("port".into(), i64::from(addr.port()).into());
        options.insert("number".into(), toml::Value::Integer(3));
        options.insert("blocksize".into(), toml::Value::Integer(2));

        let mut client = connect(&options).await.expect("connect");
        let mut server = poll_fn(|cx| backend.poll_accept(cx)).await.expect("accept");
        assert_eq!(client.address(), "127.0.0.1");

        let mut done = client.send(b"abcdefg", true).expect("send");
        while !done {
            poll_fn(|cx| client.poll_write_ready(cx)).await.expect("writable");
            done = client.flush().expect("flush");
        }
        let mut received = BytesMut::new();
        while received.len() < 7 {
            poll_fn(|cx| server.poll_read_ready(cx)).await.expect("readable");
            if let Received::Data(data) = server.recv().expect("recv") {
                received.extend_from_slice(&data);
            }
        }
        assert_eq!(&received[..], b"abcdefg");
    }

    #[tokio::test]
    async fn client_side_rejects_empty_groups() {
        let options = MultiTcpClientOptions {
            number: 0,
            ..MultiTcpClientOptions::default()
        };
        assert!(matches!(
            MultiTcpStream::connect(&options).await,
            Err(BackendError::InvalidOption { kind: NAME, .. })
        ));
    }

    #[test]
    fn group_timeout_defaults_to_ten_seconds() {
        assert_eq!(MultiTcpOptions::default().group_timeout_ms, 10_000);
    }
}
