//! One record layer to the server and the local connections carried on it.
//!
//! Local connections are opened by the client side: the first data read
//! from a new connection goes out as `SYN|DAT`, end of stream as `FIN`. The
//! server answers with `DAT`, `FIN` or `RST` for the same id.

use std::{
    collections::{BTreeMap, BTreeSet},
    task::{Context, Poll},
};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::pool::ConnIdPool;
use crate::{
    frontend::{Frontend, FrontendError},
    metrics::{self, Direction},
    mux::CloseMode,
    nonblocking::Received,
    record::{RecordError, RecordLayer},
    tunnel::{self, ConnId, Control, Packet},
};

/// Something the client loop polls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Endpoint {
    /// The record layer to the server.
    Record,
    /// A local connection.
    Local(ConnId),
}

struct Local {
    frontend: Box<dyn Frontend>,
    /// Whether `SYN` has been sent for this id.
    opened: bool,
}

/// Client-side multiplexing state.
pub struct ClientSession {
    record: Box<dyn RecordLayer>,
    locals: BTreeMap<ConnId, Local>,
    ids: ConnIdPool,
    pending: BTreeSet<Endpoint>,
    finished: bool,
}

impl ClientSession {
    /// Start a session over an established record layer.
    #[must_use]
    pub fn new(record: Box<dyn RecordLayer>) -> Self {
        Self {
            record,
            locals: BTreeMap::new(),
            ids: ConnIdPool::new(),
            pending: BTreeSet::new(),
            finished: false,
        }
    }

    /// Whether the record layer has ended; nothing more will be carried.
    #[must_use]
    pub fn is_finished(&self) -> bool { self.finished }

    /// Number of open local connections.
    #[must_use]
    pub fn local_count(&self) -> usize { self.locals.len() }

    /// Returns `true` if `endpoint` has output waiting for write readiness.
    #[must_use]
    pub fn is_pending(&self, endpoint: Endpoint) -> bool { self.pending.contains(&endpoint) }

    /// Take a newly accepted local connection, assigning it a free id.
    ///
    /// Returns `None`, after resetting `frontend`, when every id is in use.
    pub fn attach(&mut self, mut frontend: Box<dyn Frontend>) -> Option<ConnId> {
        let Some(id) = self.ids.allocate() else {
            warn!(layer = "frontend", client = self.record.address(), "no free connection id");
            metrics::inc_errors("conn_ids_exhausted");
            frontend.reset();
            return None;
        };
        debug!(layer = "frontend", client = self.record.address(), conn_id = %id, "local connection accepted");
        self.locals.insert(
            id,
            Local {
                frontend,
                opened: false,
            },
        );
        Some(id)
    }

    /// Collect endpoints that are ready to read, and pending ones ready to
    /// write.
    pub fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
        readable: &mut Vec<Endpoint>,
        writable: &mut Vec<Endpoint>,
    ) {
        if self.finished {
            return;
        }
        if self.record.poll_read_ready(cx).is_ready() {
            readable.push(Endpoint::Record);
        }
        for (id, local) in &mut self.locals {
            if local.frontend.poll_read_ready(cx).is_ready() {
                readable.push(Endpoint::Local(*id));
            }
        }
        for endpoint in &self.pending {
            let ready = match endpoint {
                Endpoint::Record => Some(self.record.poll_write_ready(cx)),
                Endpoint::Local(id) => self
                    .locals
                    .get_mut(id)
                    .map(|local| local.frontend.poll_write_ready(cx)),
            };
            if ready.is_none_or(|poll| matches!(poll, Poll::Ready(_))) {
                writable.push(*endpoint);
            }
        }
    }

    /// Handle a readable endpoint.
    pub fn on_readable(&mut self, endpoint: Endpoint) {
        match endpoint {
            Endpoint::Record => self.on_record_readable(),
            Endpoint::Local(id) => self.on_local_readable(id),
        }
    }

    /// Read a batch from the server and apply every packet in order.
    pub fn on_record_readable(&mut self) {
        if self.finished {
            return;
        }
        match self.record.receive_packets() {
            Ok(Some(batch)) => self.apply_batch(batch),
            Ok(None) => {
                info!(layer = "record", client = self.record.address(), "server closed the tunnel");
                self.finish(CloseMode::Graceful);
            }
            Err(err) => self.record_failed(&err),
        }
    }

    /// Apply packets received from the server.
    pub fn apply_batch(&mut self, batch: impl IntoIterator<Item = Bytes>) {
        for raw in batch {
            if self.finished {
                return;
            }
            match Packet::decode(raw) {
                Ok(packet) => {
                    metrics::inc_packets(Direction::Inbound);
                    self.apply_packet(packet);
                }
                Err(err) => {
                    error!(layer = "tunnel", client = self.record.address(), error = %err, "dropping malformed packet");
                    metrics::inc_errors("packet");
                }
            }
        }
    }

    /// Read from a local connection and forward it to the server.
    pub fn on_local_readable(&mut self, id: ConnId) {
        let Some(local) = self.locals.get_mut(&id) else {
            return;
        };
        match local.frontend.recv() {
            Ok(Received::Empty) => {}
            Ok(Received::Data(data)) => {
                let control = if local.opened {
                    Control::DAT
                } else {
                    local.opened = true;
                    Control::SYN | Control::DAT
                };
                self.send_packet(control, id, &data);
            }
            Ok(Received::Eof) => {
                if local.opened {
                    self.send_packet(Control::FIN, id, &[]);
                }
                self.close_local(id, CloseMode::Graceful);
            }
            Err(err) => self.local_failed(id, &err),
        }
    }

    /// Retry a pending write.
    pub fn on_writable(&mut self, endpoint: Endpoint) {
        match endpoint {
            Endpoint::Record => match self.record.continue_sending() {
                Ok(true) => {
                    self.pending.remove(&endpoint);
                }
                Ok(false) => {}
                Err(err) => self.record_failed(&err),
            },
            Endpoint::Local(id) => {
                let Some(local) = self.locals.get_mut(&id) else {
                    self.pending.remove(&endpoint);
                    return;
                };
                match local.frontend.flush() {
                    Ok(true) => {
                        self.pending.remove(&endpoint);
                    }
                    Ok(false) => {}
                    Err(err) => self.local_failed(id, &err),
                }
            }
        }
    }

    /// Close every local connection and the record layer gracefully.
    pub fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.record.close() {
            debug!(layer = "record", client = self.record.address(), error = %err, "close notification not sent");
        }
        self.finish(CloseMode::Graceful);
    }

    fn apply_packet(&mut self, packet: Packet) {
        let Packet {
            control,
            conn_id,
            payload,
        } = packet;
        let Some(local) = self.locals.get_mut(&conn_id) else {
            debug!(layer = "tunnel", client = self.record.address(), %conn_id, %control, "packet for closed connection dropped");
            return;
        };
        if control.contains(Control::RST) {
            self.close_local(conn_id, CloseMode::Reset);
            return;
        }
        if control.contains(Control::DAT) {
            match local.frontend.send(&payload) {
                Ok(true) => {}
                Ok(false) => {
                    self.pending.insert(Endpoint::Local(conn_id));
                }
                Err(err) => {
                    self.local_failed(conn_id, &err);
                    return;
                }
            }
        }
        if control.contains(Control::FIN) {
            self.close_local(conn_id, CloseMode::Graceful);
        }
    }

    fn send_packet(&mut self, control: Control, conn_id: ConnId, payload: &[u8]) {
        let bytes = tunnel::encode(control, conn_id, payload);
        match self.record.send_packet(&bytes) {
            Ok(true) => {
                self.pending.remove(&Endpoint::Record);
            }
            Ok(false) => {
                self.pending.insert(Endpoint::Record);
            }
            Err(err) => return self.record_failed(&err),
        }
        metrics::inc_packets(Direction::Outbound);
    }

    fn close_local(&mut self, id: ConnId, mode: CloseMode) {
        let Some(mut local) = self.locals.remove(&id) else {
            return;
        };
        self.pending.remove(&Endpoint::Local(id));
        match mode {
            CloseMode::Graceful => local.frontend.close(),
            CloseMode::Reset => local.frontend.reset(),
        }
        self.ids.release(id);
    }

    fn local_failed(&mut self, id: ConnId, err: &FrontendError) {
        error!(layer = "frontend", client = self.record.address(), conn_id = %id, error = %err, "local connection failed");
        metrics::inc_errors("frontend");
        let opened = self.locals.get(&id).is_some_and(|local| local.opened);
        if opened {
            self.send_packet(Control::RST, id, &[]);
        }
        self.close_local(id, CloseMode::Reset);
    }

    fn record_failed(&mut self, err: &RecordError) {
        let kind = err.kind();
        warn!(layer = "record", client = self.record.address(), kind = kind.as_str(), error = %err, "{}", kind.describe());
        metrics::inc_errors(kind.as_str());
        self.finish(CloseMode::Reset);
    }

    /// Close every local connection and the transport.
    fn finish(&mut self, mode: CloseMode) {
        if self.finished {
            return;
        }
        self.finished = true;
        let ids: Vec<ConnId> = self.locals.keys().copied().collect();
        for id in ids {
            self.close_local(id, mode);
        }
        self.pending.clear();
        self.record.close_transport();
    }
}
