//! Scriptable frontends and a factory that hands out their probes.

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use usocks::{
    frontend::{Frontend, FrontendError, FrontendFactory},
    nonblocking::Received,
};

/// Something the multiplexer did to a frontend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrontendEvent {
    /// `send` was called with these bytes.
    Sent(Bytes),
    /// `flush` was called.
    Flushed,
    /// `close` was called.
    Closed,
    /// `reset` was called.
    Reset,
}

/// Outcome of one scripted `recv`.
enum Step {
    Received(Received),
    Error(io::ErrorKind),
    Panic(&'static str),
}

#[derive(Default)]
struct State {
    events: Vec<FrontendEvent>,
    inbox: VecDeque<Step>,
    partial: bool,
    fail_send: bool,
    waker: Option<Waker>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Frontend whose behaviour is scripted through a [`FrontendProbe`].
pub struct MockFrontend(Arc<Mutex<State>>);

/// Test-side handle to one [`MockFrontend`].
#[derive(Clone)]
pub struct FrontendProbe(Arc<Mutex<State>>);

impl MockFrontend {
    /// Create a frontend and its probe.
    #[must_use]
    pub fn new() -> (Self, FrontendProbe) {
        let state = Arc::new(Mutex::new(State::default()));
        (Self(Arc::clone(&state)), FrontendProbe(state))
    }
}

impl FrontendProbe {
    fn push(&self, item: Step) {
        let mut state = lock(&self.0);
        state.inbox.push_back(item);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Make the next `recv` return `data`.
    pub fn push_data(&self, data: &[u8]) {
        self.push(Step::Received(Received::Data(Bytes::copy_from_slice(data))));
    }

    /// Make the next `recv` report nothing available.
    pub fn push_empty(&self) { self.push(Step::Received(Received::Empty)); }

    /// Make the next `recv` report end of stream.
    pub fn push_eof(&self) { self.push(Step::Received(Received::Eof)); }

    /// Make the next `recv` fail.
    pub fn push_error(&self, kind: io::ErrorKind) { self.push(Step::Error(kind)); }

    /// Make the next `recv` panic with `message`.
    pub fn push_panic(&self, message: &'static str) { self.push(Step::Panic(message)); }

    /// While set, `send` and `flush` report incomplete writes.
    pub fn set_partial(&self, partial: bool) { lock(&self.0).partial = partial; }

    /// While set, `send` fails.
    pub fn set_fail_send(&self, fail: bool) { lock(&self.0).fail_send = fail; }

    /// Every call recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<FrontendEvent> { lock(&self.0).events.clone() }

    /// Concatenation of everything passed to `send`.
    #[must_use]
    pub fn received(&self) -> Vec<u8> {
        lock(&self.0)
            .events
            .iter()
            .filter_map(|event| match event {
                FrontendEvent::Sent(data) => Some(data.as_ref()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Number of `flush` calls.
    #[must_use]
    pub fn flushes(&self) -> usize { self.count(&FrontendEvent::Flushed) }

    /// Whether `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.count(&FrontendEvent::Closed) > 0 }

    /// Whether `reset` was called.
    #[must_use]
    pub fn is_reset(&self) -> bool { self.count(&FrontendEvent::Reset) > 0 }

    /// Whether the frontend was closed or reset.
    #[must_use]
    pub fn is_finished(&self) -> bool { self.is_closed() || self.is_reset() }

    fn count(&self, wanted: &FrontendEvent) -> usize {
        lock(&self.0).events.iter().filter(|e| *e == wanted).count()
    }
}

impl Frontend for MockFrontend {
    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = lock(&self.0);
        if state.inbox.is_empty() {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_write_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> { Poll::Ready(Ok(())) }

    fn recv(&mut self) -> Result<Received, FrontendError> {
        let step = lock(&self.0).inbox.pop_front();
        match step {
            Some(Step::Received(received)) => Ok(received),
            Some(Step::Error(kind)) => Err(FrontendError::Io(kind.into())),
            Some(Step::Panic(message)) => panic!("{message}"),
            None => Ok(Received::Empty),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<bool, FrontendError> {
        let mut state = lock(&self.0);
        state.events.push(FrontendEvent::Sent(Bytes::copy_from_slice(data)));
        if state.fail_send {
            return Err(FrontendError::Io(io::ErrorKind::BrokenPipe.into()));
        }
        Ok(!state.partial)
    }

    fn flush(&mut self) -> Result<bool, FrontendError> {
        let mut state = lock(&self.0);
        state.events.push(FrontendEvent::Flushed);
        Ok(!state.partial)
    }

    fn close(&mut self) { lock(&self.0).events.push(FrontendEvent::Closed); }

    fn reset(&mut self) { lock(&self.0).events.push(FrontendEvent::Reset); }
}

/// Factory producing [`MockFrontend`]s and remembering their probes.
#[derive(Clone, Default)]
pub struct MockFactory {
    probes: Arc<Mutex<Vec<FrontendProbe>>>,
    unavailable: Arc<AtomicBool>,
}

impl MockFactory {
    /// Create an available factory.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Toggle whether the factory reports unavailability.
    pub fn set_available(&self, available: bool) { self.unavailable.store(!available, Ordering::SeqCst); }

    /// The closure to hand to [`usocks::Multiplexer::new`].
    #[must_use]
    pub fn factory(&self) -> FrontendFactory {
        let this = self.clone();
        Arc::new(move || {
            if this.unavailable.load(Ordering::SeqCst) {
                return Err(FrontendError::Unavailable("mock frontend disabled".into()));
            }
            let (frontend, probe) = MockFrontend::new();
            this.probes
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(probe);
            let frontend: Box<dyn Frontend> = Box::new(frontend);
            Ok(frontend)
        })
    }

    /// Probes of every frontend created so far, oldest first.
    #[must_use]
    pub fn probes(&self) -> Vec<FrontendProbe> {
        self.probes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of frontends created.
    #[must_use]
    pub fn created(&self) -> usize { self.probes().len() }

    /// Probe of the most recently created frontend.
    #[must_use]
    pub fn last(&self) -> Option<FrontendProbe> { self.probes().pop() }
}
