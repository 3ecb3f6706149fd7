//! [`RecordConnection`]: the production [`RecordLayer`].

use std::{
    fmt, io,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::future::poll_fn;
use ring::rand::SystemRandom;

use super::{
    RecordError, RecordLayer, TAG_LEN,
    cipher::{DirectionKey, PresharedKey, SALT_LEN, crypto_failure, random_bytes},
    header::{HEADER_LEN, Header, MAX_RECORD_DATA, RecordType},
};
use crate::{backend::BackendStream, nonblocking::Received};

const LENGTH_LEN: usize = 2;
const CONTROL_PADDING: usize = 16;

/// Encrypted, authenticated record framing over a backend stream.
///
/// Both ends run the same code: the server wraps accepted streams and a
/// client wraps the stream it connected. Keys depend on both salts, so
/// nothing can be sealed until the peer's salt has arrived; records sent
/// before then are held and go out once the keys exist.
pub struct RecordConnection {
    stream: Box<dyn BackendStream>,
    psk: PresharedKey,
    rng: SystemRandom,
    local_salt: [u8; SALT_LEN],
    keys: Option<Keys>,
    held: Vec<Held>,
    input: BytesMut,
    partial: BytesMut,
    secure_closed: bool,
}

struct Keys {
    sealer: DirectionKey,
    opener: DirectionKey,
}

/// Output requested before the keys were derived.
enum Held {
    Packet(Bytes),
    Control(RecordType),
}

impl RecordConnection {
    /// Start a record layer over `stream` and send the local salt.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Transport`] if no random salt could be
    /// generated or the stream refused it.
    pub fn new(psk: PresharedKey, mut stream: Box<dyn BackendStream>) -> Result<Self, RecordError> {
        let rng = SystemRandom::new();
        let local_salt: [u8; SALT_LEN] = random_bytes(&rng).map_err(crypto_failure)?;
        stream.send(&local_salt, true)?;
        Ok(Self {
            stream,
            psk,
            rng,
            local_salt,
            keys: None,
            held: Vec::new(),
            input: BytesMut::new(),
            partial: BytesMut::new(),
            secure_closed: false,
        })
    }

    /// Whether the peer's salt has arrived and records can be sealed.
    #[must_use]
    pub fn is_established(&self) -> bool { self.keys.is_some() }

    /// Wait for the peer's salt.
    ///
    /// Returns any packets that arrived along with it.
    ///
    /// # Errors
    ///
    /// Returns the record-layer error raised while reading, or
    /// [`RecordError::Transport`] if the peer hung up first.
    pub async fn handshake(&mut self) -> Result<Vec<Bytes>, RecordError> {
        let mut early = Vec::new();
        while !self.is_established() {
            poll_fn(|cx| self.poll_read_ready(cx)).await?;
            match self.receive_packets()? {
                Some(batch) => early.extend(batch),
                None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            }
        }
        Ok(early)
    }

    fn send_control(&mut self, kind: RecordType) -> Result<bool, RecordError> {
        let Some(keys) = self.keys.as_mut() else {
            self.held.push(Held::Control(kind));
            return Ok(false);
        };
        let mut out = BytesMut::new();
        seal_control(&mut keys.sealer, &self.rng, kind, &mut out)?;
        Ok(self.stream.send(&out, true)?)
    }

    /// Derive both keys from the peer's salt and seal any held output.
    fn establish(&mut self, peer_salt: &[u8]) -> Result<(), RecordError> {
        // A peer echoing our own salt would get our records accepted as its own.
        if *peer_salt == self.local_salt {
            return Err(RecordError::HashFailure);
        }
        let mut sealer =
            DirectionKey::derive(&self.psk, &self.local_salt, peer_salt).map_err(crypto_failure)?;
        let opener =
            DirectionKey::derive(&self.psk, peer_salt, &self.local_salt).map_err(crypto_failure)?;
        let mut out = BytesMut::new();
        for held in std::mem::take(&mut self.held) {
            match held {
                Held::Packet(packet) => seal_packet(&mut sealer, &packet, &mut out)?,
                Held::Control(kind) => seal_control(&mut sealer, &self.rng, kind, &mut out)?,
            }
        }
        self.keys = Some(Keys { sealer, opener });
        if !out.is_empty() {
            self.stream.send(&out, true)?;
        }
        Ok(())
    }

    fn extract_packets(&mut self) -> Result<Vec<Bytes>, RecordError> {
        let mut packets = Vec::new();
        if self.keys.is_none() {
            if self.input.len() < SALT_LEN {
                return Ok(packets);
            }
            let peer_salt = self.input.split_to(SALT_LEN);
            self.establish(&peer_salt)?;
        }
        let Some(Keys { opener, .. }) = self.keys.as_mut() else {
            return Ok(packets);
        };

        while self.input.len() >= LENGTH_LEN {
            let sealed_len = usize::from(u16::from_be_bytes([self.input[0], self.input[1]]));
            if sealed_len < HEADER_LEN + TAG_LEN {
                return Err(RecordError::InvalidHeader);
            }
            if self.input.len() < LENGTH_LEN + sealed_len {
                break;
            }
            let mut record = self.input.split_to(LENGTH_LEN + sealed_len);
            let (prefix, sealed) = record.split_at_mut(LENGTH_LEN);
            let plain = opener
                .open(prefix, sealed)
                .map_err(|_| RecordError::HashFailure)?;
            let header = Header::parse(plain)?;
            let data = &plain[HEADER_LEN..HEADER_LEN + usize::from(header.data_len)];
            match header.kind {
                RecordType::NoData => {}
                RecordType::Reset => return Err(RecordError::RemoteReset),
                RecordType::Close => self.secure_closed = true,
                RecordType::Part => self.partial.extend_from_slice(data),
                RecordType::Data if self.partial.is_empty() => {
                    packets.push(Bytes::copy_from_slice(data));
                }
                RecordType::Data => {
                    self.partial.extend_from_slice(data);
                    packets.push(self.partial.split().freeze());
                }
            }
        }
        Ok(packets)
    }
}

fn seal_record(
    sealer: &mut DirectionKey,
    kind: RecordType,
    data: &[u8],
    padding: &[u8],
    out: &mut BytesMut,
) -> Result<(), RecordError> {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "callers split data at MAX_RECORD_DATA and pad with at most u8::MAX bytes"
    )]
    let header = Header {
        kind,
        data_len: data.len() as u16,
        padding_len: padding.len() as u8,
    };
    let mut body = Vec::with_capacity(header.record_len() + TAG_LEN);
    header.write(&mut body);
    body.extend_from_slice(data);
    body.extend_from_slice(padding);
    #[expect(
        clippy::cast_possible_truncation,
        reason = "record size is bounded below u16::MAX at compile time"
    )]
    let prefix = ((body.len() + TAG_LEN) as u16).to_be_bytes();
    sealer.seal(&prefix, &mut body).map_err(crypto_failure)?;
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&body);
    Ok(())
}

/// Seal `packet` as `Part` records followed by one `Data` record.
fn seal_packet(
    sealer: &mut DirectionKey,
    packet: &[u8],
    out: &mut BytesMut,
) -> Result<(), RecordError> {
    if packet.is_empty() {
        return seal_record(sealer, RecordType::Data, &[], &[], out);
    }
    let mut chunks = packet.chunks(MAX_RECORD_DATA).peekable();
    while let Some(chunk) = chunks.next() {
        let kind = if chunks.peek().is_some() {
            RecordType::Part
        } else {
            RecordType::Data
        };
        seal_record(sealer, kind, chunk, &[], out)?;
    }
    Ok(())
}

fn seal_control(
    sealer: &mut DirectionKey,
    rng: &SystemRandom,
    kind: RecordType,
    out: &mut BytesMut,
) -> Result<(), RecordError> {
    let padding: [u8; CONTROL_PADDING] = random_bytes(rng).map_err(crypto_failure)?;
    seal_record(sealer, kind, &[], &padding, out)
}

impl fmt::Debug for RecordConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordConnection")
            .field("address", &self.stream.address())
            .field("established", &self.keys.is_some())
            .field("secure_closed", &self.secure_closed)
            .finish_non_exhaustive()
    }
}

impl RecordLayer for RecordConnection {
    fn address(&self) -> &str { self.stream.address() }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_read_ready(cx)
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_write_ready(cx)
    }

    fn receive_packets(&mut self) -> Result<Option<Vec<Bytes>>, RecordError> {
        match self.stream.recv()? {
            Received::Eof if self.secure_closed => Ok(None),
            Received::Eof => Err(RecordError::InsecureClosing),
            Received::Empty => Ok(Some(Vec::new())),
            Received::Data(data) => {
                self.input.extend_from_slice(&data);
                match self.extract_packets() {
                    Ok(packets) => Ok(Some(packets)),
                    Err(err) => {
                        if err.kind().warrants_reset() {
                            let _ = self.send_control(RecordType::Reset);
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<bool, RecordError> {
        let Some(keys) = self.keys.as_mut() else {
            self.held.push(Held::Packet(Bytes::copy_from_slice(packet)));
            return Ok(false);
        };
        let mut out = BytesMut::new();
        seal_packet(&mut keys.sealer, packet, &mut out)?;
        Ok(self.stream.send(&out, true)?)
    }

    fn continue_sending(&mut self) -> Result<bool, RecordError> {
        let flushed = self.stream.flush()?;
        Ok(flushed && self.held.is_empty())
    }

    fn close(&mut self) -> Result<(), RecordError> {
        self.send_control(RecordType::Close)?;
        Ok(())
    }

    fn close_transport(&mut self) { self.stream.close(); }
}
