//! The event loop driving [`TunnelClient`].

use std::{
    future::Future,
    io,
    pin::{Pin, pin},
    task::{Context, Poll},
};

use futures::future::poll_fn;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::{Sleep, sleep},
};
use tracing::{info, warn};

use super::{ClientError, ClientSession, Endpoint, TunnelClient};
use crate::{frontend::TcpFrontend, metrics, server::shutdown_signal};

#[derive(Default)]
struct Events {
    accepted: Option<io::Result<TcpStream>>,
    readable: Vec<Endpoint>,
    writable: Vec<Endpoint>,
}

impl Events {
    fn is_empty(&self) -> bool {
        self.accepted.is_none() && self.readable.is_empty() && self.writable.is_empty()
    }
}

impl TunnelClient {
    /// Run until SIGINT or SIGTERM is received, the server closes the
    /// tunnel, or the [`shutdown_token`](Self::shutdown_token) is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Signal`] if the signal handlers cannot be
    /// installed.
    pub async fn run(self) -> Result<(), ClientError> {
        let signal = shutdown_signal().map_err(ClientError::Signal)?;
        self.run_with_shutdown(signal).await
    }

    /// Run until `shutdown` resolves, the token is cancelled or the record
    /// layer ends.
    ///
    /// Readable endpoints are handled before writable ones. When the
    /// record layer ends, every local connection is closed with it and the
    /// loop returns.
    ///
    /// # Errors
    ///
    /// This function currently always returns `Ok(())`.
    pub async fn run_with_shutdown<S>(mut self, shutdown: S) -> Result<(), ClientError>
    where
        S: Future<Output = ()> + Send,
    {
        let token = self.shutdown.clone();
        let mut shutdown = pin!(shutdown);
        let mut pause: Option<Pin<Box<Sleep>>> = None;
        let mut delay = self.backoff.initial_delay;

        if let Ok(addr) = self.listener.local_addr() {
            info!(layer = "frontend", client = "-", %addr, "accepting local connections");
        }

        while !self.session.is_finished() {
            let events = select! {
                biased;

                () = token.cancelled() => None,
                () = &mut shutdown => {
                    token.cancel();
                    None
                }
                events = poll_fn(|cx| poll_events(cx, &self.listener, &mut self.session, &mut pause)) => Some(events),
            };
            let Some(events) = events else { break };

            if let Some(accepted) = events.accepted {
                match accepted.and_then(TcpFrontend::from_stream) {
                    Ok(frontend) => {
                        delay = self.backoff.initial_delay;
                        self.session.attach(Box::new(frontend));
                    }
                    Err(e) => {
                        warn!(layer = "frontend", client = "-", error = %e, pause = ?delay, "accept failed");
                        metrics::inc_errors("accept");
                        pause = Some(Box::pin(sleep(delay)));
                        delay = self.backoff.next(delay);
                    }
                }
            }
            for endpoint in events.readable {
                self.session.on_readable(endpoint);
            }
            for endpoint in events.writable {
                self.session.on_writable(endpoint);
            }
        }

        self.session.shutdown();
        info!(layer = "tunnel", client = "-", "client stopped");
        Ok(())
    }
}

fn poll_events(
    cx: &mut Context<'_>,
    listener: &TcpListener,
    session: &mut ClientSession,
    pause: &mut Option<Pin<Box<Sleep>>>,
) -> Poll<Events> {
    let mut events = Events::default();
    if let Some(timer) = pause
        && timer.as_mut().poll(cx).is_ready()
    {
        *pause = None;
    }
    if pause.is_none()
        && let Poll::Ready(accepted) = listener.poll_accept(cx)
    {
        events.accepted = Some(accepted.map(|(stream, _)| stream));
    }
    session.poll_ready(cx, &mut events.readable, &mut events.writable);
    if events.is_empty() {
        Poll::Pending
    } else {
        Poll::Ready(events)
    }
}
