//! Encoding and decoding of multiplex packets.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Control, HEADER_LEN, PacketError, VERSION};

/// Identifier of a virtual connection inside one record layer.
///
/// Ids are chosen by the peer and are only unique per record layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u16);

impl ConnId {
    /// Wrap a raw connection id.
    #[must_use]
    pub const fn new(id: u16) -> Self { Self(id) }

    /// Return the raw value.
    #[must_use]
    pub const fn get(self) -> u16 { self.0 }
}

impl From<u16> for ConnId {
    fn from(value: u16) -> Self { Self(value) }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// One unit of multiplex traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Control flags.
    pub control: Control,
    /// Virtual connection the packet belongs to.
    pub conn_id: ConnId,
    /// Attached payload; empty for pure control packets.
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet from its parts.
    #[must_use]
    pub fn new(control: Control, conn_id: ConnId, payload: Bytes) -> Self {
        Self {
            control,
            conn_id,
            payload,
        }
    }

    /// Build a packet without payload.
    #[must_use]
    pub fn control(control: Control, conn_id: ConnId) -> Self {
        Self::new(control, conn_id, Bytes::new())
    }

    /// Serialise the packet.
    #[must_use]
    pub fn encode(&self) -> Bytes { encode(self.control, self.conn_id, &self.payload) }

    /// Parse a complete packet as delivered by the record layer.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] when `bytes` is shorter than a
    /// header and [`PacketError::UnsupportedVersion`] for a foreign version.
    pub fn decode(mut bytes: Bytes) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::Truncated(bytes.len()));
        }
        let version = bytes.get_u8();
        if version != VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let control = Control::from_bits_truncate(bytes.get_u8());
        let conn_id = ConnId(bytes.get_u16());
        Ok(Self::new(control, conn_id, bytes))
    }
}

/// Prefix `payload` with a multiplex header.
#[must_use]
pub fn encode(control: Control, conn_id: ConnId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(VERSION);
    buf.put_u8(control.bits());
    buf.put_u16(conn_id.0);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn header_layout_is_network_order() {
        let bytes = encode(Control::SYN | Control::DAT, ConnId::new(0x0102), b"hi");
        assert_eq!(&bytes[..], &[1, 0x03, 0x01, 0x02, b'h', b'i']);
    }

    #[test]
    fn decode_splits_header_and_payload() {
        let packet = Packet::decode(Bytes::from_static(&[1, 0x04, 0xff, 0xfe]))
            .expect("valid packet");
        assert_eq!(packet.control, Control::FIN);
        assert_eq!(packet.conn_id, ConnId::new(0xfffe));
        assert!(packet.payload.is_empty());
    }

    #[rstest]
    #[case(&[], PacketError::Truncated(0))]
    #[case(&[1, 2, 0], PacketError::Truncated(3))]
    #[case(&[2, 2, 0, 1], PacketError::UnsupportedVersion(2))]
    fn malformed_headers_are_rejected(#[case] raw: &'static [u8], #[case] expected: PacketError) {
        assert_eq!(Packet::decode(Bytes::from_static(raw)), Err(expected));
    }

    #[test]
    fn encode_is_inverse_of_decode() {
        let packet = Packet::new(Control::DAT, ConnId::new(7), Bytes::from_static(b"payload"));
        assert_eq!(Packet::decode(packet.encode()), Ok(packet));
    }
}
