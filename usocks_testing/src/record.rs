//! Scriptable record layer for driving the multiplexer directly.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use usocks::{
    Packet,
    record::{RecordError, RecordErrorKind, RecordLayer},
};

enum Step {
    Packets(Vec<Bytes>),
    Eof,
    Fail(RecordErrorKind),
}

#[derive(Default)]
struct State {
    script: VecDeque<Step>,
    sent: Vec<Bytes>,
    partial: bool,
    fail_send: bool,
    continue_calls: usize,
    close_notified: bool,
    transport_closed: bool,
    waker: Option<Waker>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn error_of(kind: RecordErrorKind) -> RecordError {
    match kind {
        RecordErrorKind::HashFailure => RecordError::HashFailure,
        RecordErrorKind::InvalidHeader => RecordError::InvalidHeader,
        RecordErrorKind::RemoteReset => RecordError::RemoteReset,
        RecordErrorKind::InsecureClosing => RecordError::InsecureClosing,
        RecordErrorKind::Transport => RecordError::Transport(io::ErrorKind::BrokenPipe.into()),
    }
}

/// Record layer returning scripted batches and capturing sent packets.
pub struct MockRecordLayer {
    state: Arc<Mutex<State>>,
    address: String,
}

/// Test-side handle to a [`MockRecordLayer`].
#[derive(Clone)]
pub struct RecordProbe(Arc<Mutex<State>>);

/// Create a mock record layer labelled `address` and its probe.
#[must_use]
pub fn mock_record_layer(address: &str) -> (MockRecordLayer, RecordProbe) {
    let state = Arc::new(Mutex::new(State::default()));
    (
        MockRecordLayer {
            state: Arc::clone(&state),
            address: address.to_owned(),
        },
        RecordProbe(state),
    )
}

impl RecordProbe {
    fn push(&self, step: Step) {
        let mut state = lock(&self.0);
        state.script.push_back(step);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Queue one batch of packets for the next `receive_packets`.
    pub fn push_packets(&self, packets: impl IntoIterator<Item = Packet>) {
        self.push(Step::Packets(packets.into_iter().map(|p| p.encode()).collect()));
    }

    /// Queue one batch of raw, possibly malformed, packets.
    pub fn push_raw(&self, packets: impl IntoIterator<Item = Bytes>) {
        self.push(Step::Packets(packets.into_iter().collect()));
    }

    /// Queue a clean end of stream.
    pub fn push_eof(&self) { self.push(Step::Eof); }

    /// Queue a failure of the given kind.
    pub fn push_error(&self, kind: RecordErrorKind) { self.push(Step::Fail(kind)); }

    /// While set, sends report incomplete flushes.
    pub fn set_partial(&self, partial: bool) { lock(&self.0).partial = partial; }

    /// While set, `send_packet` fails with a transport error.
    pub fn set_fail_send(&self, fail: bool) { lock(&self.0).fail_send = fail; }

    /// Every packet sent so far, decoded.
    ///
    /// # Panics
    ///
    /// Panics if the multiplexer sent something that is not a packet.
    #[must_use]
    pub fn sent(&self) -> Vec<Packet> {
        lock(&self.0)
            .sent
            .iter()
            .map(|raw| Packet::decode(raw.clone()).expect("multiplexer sent a malformed packet"))
            .collect()
    }

    /// Number of `continue_sending` calls.
    #[must_use]
    pub fn continue_calls(&self) -> usize { lock(&self.0).continue_calls }

    /// Whether a close notification was sent.
    #[must_use]
    pub fn close_notified(&self) -> bool { lock(&self.0).close_notified }

    /// Whether the transport was closed.
    #[must_use]
    pub fn transport_closed(&self) -> bool { lock(&self.0).transport_closed }
}

impl RecordLayer for MockRecordLayer {
    fn address(&self) -> &str { &self.address }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = lock(&self.state);
        if state.script.is_empty() {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_write_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> { Poll::Ready(Ok(())) }

    fn receive_packets(&mut self) -> Result<Option<Vec<Bytes>>, RecordError> {
        match lock(&self.state).script.pop_front() {
            Some(Step::Packets(packets)) => Ok(Some(packets)),
            Some(Step::Eof) => Ok(None),
            Some(Step::Fail(kind)) => Err(error_of(kind)),
            None => Ok(Some(Vec::new())),
        }
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<bool, RecordError> {
        let mut state = lock(&self.state);
        if state.fail_send {
            return Err(error_of(RecordErrorKind::Transport));
        }
        state.sent.push(Bytes::copy_from_slice(packet));
        Ok(!state.partial)
    }

    fn continue_sending(&mut self) -> Result<bool, RecordError> {
        let mut state = lock(&self.state);
        state.continue_calls += 1;
        Ok(!state.partial)
    }

    fn close(&mut self) -> Result<(), RecordError> {
        lock(&self.state).close_notified = true;
        Ok(())
    }

    fn close_transport(&mut self) { lock(&self.state).transport_closed = true; }
}
