//! The event loop driving [`TunnelServer`].

use std::{
    future::Future,
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::{Pin, pin},
    task::{Context, Poll},
};

use futures::future::poll_fn;
use tokio::{
    select,
    time::{Sleep, sleep},
};
use tracing::{Level, debug, error, info, warn};

use super::{ServerError, TunnelServer};
use crate::{
    backend::{Backend, BackendStream},
    metrics,
    mux::{MuxError, Multiplexer},
    panic::format_panic,
    pending::Endpoint,
    record::RecordConnection,
};

/// Everything that became ready in one wake-up.
#[derive(Default)]
struct Events {
    accepted: Option<io::Result<Box<dyn BackendStream>>>,
    readable: Vec<Endpoint>,
    writable: Vec<Endpoint>,
}

impl Events {
    fn is_empty(&self) -> bool {
        self.accepted.is_none() && self.readable.is_empty() && self.writable.is_empty()
    }
}

impl TunnelServer {
    /// Run until SIGINT or SIGTERM is received, or the
    /// [`shutdown_token`](Self::shutdown_token) is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Signal`] if the signal handlers cannot be
    /// installed. Nothing that happens inside the loop is returned.
    pub async fn run(self) -> Result<(), ServerError> {
        let signal = shutdown_signal().map_err(ServerError::Signal)?;
        self.run_with_shutdown(signal).await
    }

    /// Run until `shutdown` resolves or the token is cancelled.
    ///
    /// Each iteration waits for readiness of the backend, every record
    /// layer, every virtual connection and every pending writer. Readable
    /// endpoints are then handled before writable ones. A handler that
    /// fails or panics is logged and the loop carries on.
    ///
    /// On exit every record layer is torn down gracefully and the backend is
    /// closed.
    ///
    /// # Errors
    ///
    /// This function currently always returns `Ok(())`.
    pub async fn run_with_shutdown<S>(mut self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let token = self.shutdown.clone();
        let mut shutdown = pin!(shutdown);
        let mut pause: Option<Pin<Box<Sleep>>> = None;
        let mut delay = self.backoff.initial_delay;

        if let Ok(addr) = self.backend.local_addr() {
            info!(layer = "tunnel", client = "-", %addr, "listening");
        }

        loop {
            let events = select! {
                biased;

                () = token.cancelled() => None,
                () = &mut shutdown => {
                    token.cancel();
                    None
                }
                events = poll_fn(|cx| poll_events(cx, &mut *self.backend, &mut self.mux, &mut pause)) => Some(events),
            };
            let Some(events) = events else { break };

            if let Some(accepted) = events.accepted {
                match accepted {
                    Ok(stream) => {
                        delay = self.backoff.initial_delay;
                        self.attach(stream);
                    }
                    Err(e) => {
                        warn!(layer = "tunnel", client = "-", error = %e, pause = ?delay, "accept failed");
                        metrics::inc_errors("accept");
                        pause = Some(Box::pin(sleep(delay)));
                        delay = self.backoff.next(delay);
                    }
                }
            }
            for endpoint in events.readable {
                dispatch(&mut self.mux, |mux| mux.on_readable(endpoint));
            }
            for endpoint in events.writable {
                dispatch(&mut self.mux, |mux| mux.on_writable(endpoint));
            }
        }

        self.mux.shutdown();
        self.backend.close();
        info!(layer = "tunnel", client = "-", "server stopped");
        Ok(())
    }

    fn attach(&mut self, stream: Box<dyn BackendStream>) {
        let client = stream.address().to_owned();
        match RecordConnection::new(self.key.clone(), stream) {
            Ok(layer) => {
                self.mux.attach(Box::new(layer));
            }
            Err(err) => {
                warn!(layer = "record", client = %client, error = %err, "cannot start record layer");
                metrics::inc_errors(err.kind().as_str());
            }
        }
    }
}

fn poll_events(
    cx: &mut Context<'_>,
    backend: &mut dyn Backend,
    mux: &mut Multiplexer,
    pause: &mut Option<Pin<Box<Sleep>>>,
) -> Poll<Events> {
    let mut events = Events::default();
    if let Some(timer) = pause
        && timer.as_mut().poll(cx).is_ready()
    {
        *pause = None;
    }
    if pause.is_none()
        && let Poll::Ready(accepted) = backend.poll_accept(cx)
    {
        events.accepted = Some(accepted);
    }
    mux.poll_ready(cx, &mut events.readable, &mut events.writable);
    if events.is_empty() {
        Poll::Pending
    } else {
        Poll::Ready(events)
    }
}

/// Run one handler, logging errors and panics instead of propagating them.
fn dispatch(mux: &mut Multiplexer, handler: impl FnOnce(&mut Multiplexer) -> Result<(), MuxError>) {
    match catch_unwind(AssertUnwindSafe(|| handler(mux))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(layer = "tunnel", client = "-", error = %err, "unexpected error");
            if tracing::enabled!(Level::DEBUG) {
                debug!(layer = "tunnel", client = "-", error = ?err, "unexpected error detail");
            }
            metrics::inc_errors("unexpected");
        }
        Err(panic) => {
            error!(layer = "tunnel", client = "-", panic = %format_panic(panic.as_ref()), "event handler panicked");
            metrics::inc_errors("panic");
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
pub(crate) fn shutdown_signal() -> io::Result<impl Future<Output = ()> + Send> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    })
}

#[cfg(not(unix))]
pub(crate) fn shutdown_signal() -> io::Result<impl Future<Output = ()> + Send> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
    })
}
