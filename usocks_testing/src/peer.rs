//! Client side of a tunnel for end-to-end tests.

use std::{collections::VecDeque, io, net::SocketAddr};

use bytes::Bytes;
use futures::future::poll_fn;
use usocks::{
    Packet, PresharedKey, RecordConnection, RecordLayer,
    backend::PlainTcpStream,
    record::RecordError,
};

/// A peer speaking the record protocol to a server's `plain_tcp` backend.
pub struct TunnelPeer {
    record: RecordConnection,
    inbox: VecDeque<Bytes>,
}

impl TunnelPeer {
    /// Connect to `addr` and start a record layer keyed with `key`.
    ///
    /// Returns once the server's salt has arrived.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Transport`] if the connection fails, or the
    /// record-layer error raised while waiting for the salt.
    pub async fn connect(addr: SocketAddr, key: PresharedKey) -> Result<Self, RecordError> {
        let stream = PlainTcpStream::connect(addr).await?;
        let mut record = RecordConnection::new(key, Box::new(stream))?;
        let early = record.handshake().await?;
        Ok(Self {
            record,
            inbox: early.into(),
        })
    }

    /// Send one packet and wait until it has been written.
    ///
    /// # Errors
    ///
    /// Returns the record-layer error that interrupted sending.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), RecordError> {
        let done = self.record.send_packet(&packet.encode())?;
        self.drain(done).await
    }

    /// Wait for the next packet.
    ///
    /// Returns `Ok(None)` once the server has closed the record layer
    /// cleanly.
    ///
    /// # Errors
    ///
    /// Returns the record-layer error, or [`RecordError::Transport`] if the
    /// server sent something that is not a packet.
    pub async fn recv(&mut self) -> Result<Option<Packet>, RecordError> {
        loop {
            if let Some(raw) = self.inbox.pop_front() {
                let packet =
                    Packet::decode(raw).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                return Ok(Some(packet));
            }
            poll_fn(|cx| self.record.poll_read_ready(cx)).await?;
            match self.record.receive_packets()? {
                Some(batch) => self.inbox.extend(batch),
                None => return Ok(None),
            }
        }
    }

    /// Send a close record and shut the transport.
    ///
    /// # Errors
    ///
    /// Returns the error raised while sending the close record.
    pub async fn close(mut self) -> Result<(), RecordError> {
        self.record.close()?;
        let done = self.record.continue_sending()?;
        self.drain(done).await?;
        self.record.close_transport();
        Ok(())
    }

    /// Drop the transport without a close record.
    pub fn abort(mut self) { self.record.close_transport(); }

    async fn drain(&mut self, mut done: bool) -> Result<(), RecordError> {
        while !done {
            poll_fn(|cx| self.record.poll_write_ready(cx)).await?;
            done = self.record.continue_sending()?;
        }
        Ok(())
    }
}
