//! A TCP echo server to point redirect frontends at.

use std::{io, net::SocketAddr};

use tokio::{net::TcpListener, task::JoinHandle};

/// Echoes every accepted connection until the peer closes it.
///
/// The accept loop is aborted when the server is dropped.
pub struct EchoServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl EchoServer {
    /// Bind to an ephemeral loopback port and start echoing.
    ///
    /// # Errors
    ///
    /// Returns the error raised while binding.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        Ok(Self { addr, task })
    }

    /// Address the server listens on.
    #[must_use]
    pub fn addr(&self) -> SocketAddr { self.addr }
}

impl Drop for EchoServer {
    fn drop(&mut self) { self.task.abort(); }
}
