//! Dispatch of readiness events onto record layers and virtual connections.
//!
//! [`Multiplexer`] owns the connection registry and the pending-write set.
//! The event loop feeds it one readiness event at a time; each handler runs
//! to completion without awaiting, so all state lives on one task.

mod lifecycle;

use std::task::{Context, Poll};

use bytes::Bytes;
pub use lifecycle::{Plan, VirtualState};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    frontend::{Frontend, FrontendError, FrontendFactory},
    metrics::{self, Direction},
    nonblocking::Received,
    pending::{Endpoint, PendingWrites},
    record::{RecordError, RecordLayer},
    registry::{RecordId, Registry, RegistryError, Unregistered, VirtualId},
    tunnel::{self, ConnId, Control, Packet},
};

/// Errors surfaced by event handlers.
///
/// Connection-level failures are handled inside the multiplexer; these
/// indicate inconsistent bookkeeping and are logged by the event loop.
#[derive(Debug, Error)]
pub enum MuxError {
    /// A registry lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// How a record layer is taken down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Teardown {
    /// Send a close record before closing the transport.
    Graceful,
    /// Close the transport straight away.
    Abort,
}

/// How a virtual connection is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
    /// Close the frontend normally.
    Graceful,
    /// Reset the frontend.
    Reset,
}

type Conns = Registry<Box<dyn RecordLayer>, Box<dyn Frontend>>;

/// Multiplexer core: connection state plus per-event handlers.
pub struct Multiplexer {
    registry: Conns,
    pending: PendingWrites,
    factory: FrontendFactory,
}

impl Multiplexer {
    /// Create a multiplexer opening virtual connections with `factory`.
    #[must_use]
    pub fn new(factory: FrontendFactory) -> Self {
        Self {
            registry: Registry::new(),
            pending: PendingWrites::new(),
            factory,
        }
    }

    /// Registry of live connections.
    #[must_use]
    pub fn registry(&self) -> &Conns { &self.registry }

    /// Endpoints waiting for write readiness.
    #[must_use]
    pub fn pending(&self) -> &PendingWrites { &self.pending }

    /// Start multiplexing over a freshly accepted record layer.
    pub fn attach(&mut self, layer: Box<dyn RecordLayer>) -> RecordId {
        info!(layer = "record", client = layer.address(), "connected");
        let id = self.registry.register_record_layer(layer);
        self.update_gauges();
        id
    }

    /// Collect endpoints that are ready for reading and, for pending
    /// members, writing.
    ///
    /// Wakers are registered for every endpoint that is not ready.
    pub fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
        readable: &mut Vec<Endpoint>,
        writable: &mut Vec<Endpoint>,
    ) {
        for (id, layer) in self.registry.records_mut() {
            if layer.poll_read_ready(cx).is_ready() {
                readable.push(Endpoint::Record(id));
            }
        }
        for (id, frontend) in self.registry.virtuals_mut() {
            if frontend.poll_read_ready(cx).is_ready() {
                readable.push(Endpoint::Virtual(id));
            }
        }
        for endpoint in self.pending.members() {
            let ready = match endpoint {
                Endpoint::Record(id) => self
                    .registry
                    .record_mut(id)
                    .map(|layer| layer.poll_write_ready(cx)),
                Endpoint::Virtual(id) => self
                    .registry
                    .virtual_mut(id)
                    .map(|frontend| frontend.poll_write_ready(cx)),
            };
            // Stale members are handed out so the handler can drop them.
            if ready.is_none_or(|poll| matches!(poll, Poll::Ready(_))) {
                writable.push(endpoint);
            }
        }
    }

    /// Handle a readable endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError`] if bookkeeping is inconsistent.
    pub fn on_readable(&mut self, endpoint: Endpoint) -> Result<(), MuxError> {
        match endpoint {
            Endpoint::Record(id) => self.on_record_readable(id),
            Endpoint::Virtual(id) => self.on_virtual_readable(id),
        }
    }

    /// Read a batch of packets from a record layer and apply them in order.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError`] if bookkeeping is inconsistent.
    pub fn on_record_readable(&mut self, id: RecordId) -> Result<(), MuxError> {
        let Some(layer) = self.registry.record_mut(id) else {
            return Ok(());
        };
        let client = layer.address().to_owned();
        match layer.receive_packets() {
            Err(err) => self.record_failed(id, &client, &err),
            Ok(None) => {
                self.teardown_record(id, Teardown::Graceful)?;
                info!(layer = "record", client = %client, "disconnected");
                Ok(())
            }
            Ok(Some(packets)) => {
                for packet in packets {
                    if !self.registry.contains_record(id) {
                        debug!(layer = "tunnel", client = %client, "record layer gone; dropping rest of batch");
                        break;
                    }
                    self.apply_packet(id, &client, packet)?;
                }
                Ok(())
            }
        }
    }

    /// Read from a frontend and forward the result to the peer.
    ///
    /// Does nothing if the connection was closed earlier in the same
    /// iteration.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError`] if bookkeeping is inconsistent.
    pub fn on_virtual_readable(&mut self, id: VirtualId) -> Result<(), MuxError> {
        let Some(frontend) = self.registry.virtual_mut(id) else {
            return Ok(());
        };
        match frontend.recv() {
            Ok(Received::Empty) => Ok(()),
            Ok(Received::Data(data)) => {
                let (conn_id, owner) = self.registry.lookup_owner(id)?;
                self.send_packet(owner, Control::DAT, conn_id, &data)
            }
            Ok(Received::Eof) => {
                let (conn_id, owner) = self.registry.lookup_owner(id)?;
                self.send_packet(owner, Control::FIN, conn_id, &[])?;
                if self.registry.contains_virtual(id) {
                    self.close_virtual(id, CloseMode::Graceful)?;
                }
                Ok(())
            }
            Err(err) => self.frontend_failed(id, &err),
        }
    }

    /// Retry a pending write.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError`] if bookkeeping is inconsistent.
    pub fn on_writable(&mut self, endpoint: Endpoint) -> Result<(), MuxError> {
        match endpoint {
            Endpoint::Record(id) => {
                let Some(layer) = self.registry.record_mut(id) else {
                    self.pending.remove(endpoint);
                    return Ok(());
                };
                match layer.continue_sending() {
                    Ok(true) => {
                        self.pending.remove(endpoint);
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(err) => {
                        let client = layer.address().to_owned();
                        self.record_failed(id, &client, &err)
                    }
                }
            }
            Endpoint::Virtual(id) => {
                let Some(frontend) = self.registry.virtual_mut(id) else {
                    self.pending.remove(endpoint);
                    return Ok(());
                };
                match frontend.flush() {
                    Ok(true) => {
                        self.pending.remove(endpoint);
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(err) => self.frontend_failed(id, &err),
                }
            }
        }
    }

    /// Tear down every record layer gracefully.
    pub fn shutdown(&mut self) {
        for id in self.registry.record_ids() {
            let client = self
                .registry
                .record_mut(id)
                .map(|layer| layer.address().to_owned());
            if self.teardown_record(id, Teardown::Graceful).is_ok() {
                info!(layer = "record", client = client.as_deref().unwrap_or("-"), "closed on shutdown");
            }
        }
    }

    /// Remove a record layer with every virtual connection it owns.
    ///
    /// Owned frontends are closed gracefully and dropped from the
    /// pending-write set along with the record layer itself.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Registry`] if `id` is not registered.
    pub fn teardown_record(&mut self, id: RecordId, mode: Teardown) -> Result<(), MuxError> {
        let Unregistered { mut layer, virtuals } = self.registry.unregister_record_layer(id)?;
        self.pending.remove(Endpoint::Record(id));
        for (vid, mut frontend) in virtuals {
            self.pending.remove(Endpoint::Virtual(vid));
            frontend.close();
        }
        if mode == Teardown::Graceful
            && let Err(err) = layer.close()
        {
            debug!(layer = "record", client = layer.address(), error = %err, "close notification not sent");
        }
        layer.close_transport();
        self.update_gauges();
        Ok(())
    }

    /// Close one virtual connection.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Registry`] if `id` is not registered; closing
    /// twice is a bug in the caller.
    pub fn close_virtual(&mut self, id: VirtualId, mode: CloseMode) -> Result<(), MuxError> {
        let mut frontend = self.registry.close_virtual(id)?;
        self.pending.remove(Endpoint::Virtual(id));
        match mode {
            CloseMode::Graceful => frontend.close(),
            CloseMode::Reset => frontend.reset(),
        }
        self.update_gauges();
        Ok(())
    }

    fn apply_packet(&mut self, owner: RecordId, client: &str, raw: Bytes) -> Result<(), MuxError> {
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(err) => {
                error!(layer = "tunnel", client, error = %err, "dropping undecodable packet");
                metrics::inc_errors("packet");
                return Ok(());
            }
        };
        metrics::inc_packets(Direction::Inbound);
        let Packet {
            control,
            conn_id,
            payload,
        } = packet;
        let current = self.registry.lookup_virtual(owner, conn_id);
        let state = if current.is_some() {
            VirtualState::Open
        } else {
            VirtualState::Unopened
        };
        let plan = Plan::for_packet(control, state);

        if plan.dropped {
            debug!(layer = "tunnel", client, %conn_id, %control, "ignoring flags for unopened connection");
            return Ok(());
        }
        if plan.reset {
            if let Some(id) = current {
                self.close_virtual(id, CloseMode::Reset)?;
            }
            return Ok(());
        }
        if plan.replace
            && let Some(id) = current
        {
            self.close_virtual(id, CloseMode::Graceful)?;
        }
        if plan.open && !self.open_virtual(owner, client, conn_id)? {
            return Ok(());
        }
        let Some(id) = self.registry.lookup_virtual(owner, conn_id) else {
            return Ok(());
        };
        if plan.deliver {
            let Some(frontend) = self.registry.virtual_mut(id) else {
                return Ok(());
            };
            match frontend.send(&payload) {
                Ok(true) => {
                    self.pending.remove(Endpoint::Virtual(id));
                }
                Ok(false) => {
                    self.pending.add(Endpoint::Virtual(id));
                }
                Err(err) => return self.frontend_failed(id, &err),
            }
        }
        if plan.close {
            self.close_virtual(id, CloseMode::Graceful)?;
        }
        Ok(())
    }

    /// Returns `false` if the factory was unavailable and the peer was sent
    /// a reset instead.
    fn open_virtual(
        &mut self,
        owner: RecordId,
        client: &str,
        conn_id: ConnId,
    ) -> Result<bool, MuxError> {
        match (self.factory)() {
            Ok(frontend) => {
                let (_, displaced) = self.registry.open_virtual(owner, conn_id, frontend)?;
                if let Some((old, mut frontend)) = displaced {
                    self.pending.remove(Endpoint::Virtual(old));
                    frontend.close();
                }
                self.update_gauges();
                Ok(true)
            }
            Err(err) => {
                error!(layer = "frontend", client, %conn_id, error = %err, "cannot open connection");
                metrics::inc_errors("frontend_unavailable");
                self.send_packet(owner, Control::RST, conn_id, &[])?;
                Ok(false)
            }
        }
    }

    fn send_packet(
        &mut self,
        owner: RecordId,
        control: Control,
        conn_id: ConnId,
        payload: &[u8],
    ) -> Result<(), MuxError> {
        let layer = self
            .registry
            .record_mut(owner)
            .ok_or(RegistryError::UnknownRecordLayer(owner))?;
        let bytes = tunnel::encode(control, conn_id, payload);
        match layer.send_packet(&bytes) {
            Ok(true) => {
                self.pending.remove(Endpoint::Record(owner));
            }
            Ok(false) => {
                self.pending.add(Endpoint::Record(owner));
            }
            Err(err) => {
                let client = layer.address().to_owned();
                return self.record_failed(owner, &client, &err);
            }
        }
        metrics::inc_packets(Direction::Outbound);
        Ok(())
    }

    fn record_failed(&mut self, id: RecordId, client: &str, err: &RecordError) -> Result<(), MuxError> {
        let kind = err.kind();
        self.teardown_record(id, Teardown::Abort)?;
        warn!(layer = "record", client, kind = kind.as_str(), error = %err, "{}", kind.describe());
        metrics::inc_errors(kind.as_str());
        Ok(())
    }

    fn frontend_failed(&mut self, id: VirtualId, err: &FrontendError) -> Result<(), MuxError> {
        let (conn_id, owner) = self.registry.lookup_owner(id)?;
        let client = self
            .registry
            .record_mut(owner)
            .map_or_else(|| "-".to_owned(), |layer| layer.address().to_owned());
        error!(layer = "frontend", client = %client, %conn_id, error = %err, "frontend failed");
        metrics::inc_errors("frontend");
        self.send_packet(owner, Control::RST, conn_id, &[])?;
        if self.registry.contains_virtual(id) {
            self.close_virtual(id, CloseMode::Reset)?;
        }
        Ok(())
    }

    fn update_gauges(&self) {
        metrics::set_record_layers(self.registry.record_count());
        metrics::set_virtual_connections(self.registry.virtual_count());
    }
}
