//! Plaintext record header.
//!
//! ```text
//! +---------------+---------------+---------------+----------- - -
//! |  data length (u16, BE)        | padding (u8)  | type (u8)  data | padding
//! +---------------+---------------+---------------+----------- - -
//! ```

use bytes::BufMut;
use static_assertions::const_assert;

use super::{RecordError, TAG_LEN};

/// Size of the plaintext header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest data field carried by one record; longer packets are split.
pub const MAX_RECORD_DATA: usize = 16 * 1024;

// A sealed record's length must fit its u16 prefix.
const_assert!(MAX_RECORD_DATA + HEADER_LEN + u8::MAX as usize + TAG_LEN <= u16::MAX as usize);

/// Record types understood by both peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Last piece of a packet.
    Data = 1,
    /// A piece of a packet with more to follow.
    Part = 2,
    /// Carries nothing; ignored on receipt.
    NoData = 3,
    /// The sender detected tampering.
    Reset = 254,
    /// Secure close notification.
    Close = 255,
}

impl RecordType {
    /// Whether records of this type may carry data.
    #[must_use]
    pub fn carries_data(self) -> bool { matches!(self, Self::Data | Self::Part) }
}

impl TryFrom<u8> for RecordType {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Data),
            2 => Ok(Self::Part),
            3 => Ok(Self::NoData),
            254 => Ok(Self::Reset),
            255 => Ok(Self::Close),
            _ => Err(RecordError::InvalidHeader),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Header {
    pub(super) kind: RecordType,
    pub(super) data_len: u16,
    pub(super) padding_len: u8,
}

impl Header {
    /// Validate the header at the start of an opened record.
    pub(super) fn parse(plain: &[u8]) -> Result<Self, RecordError> {
        let [d0, d1, padding_len, kind, ..] = *plain else {
            return Err(RecordError::InvalidHeader);
        };
        let header = Self {
            kind: RecordType::try_from(kind)?,
            data_len: u16::from_be_bytes([d0, d1]),
            padding_len,
        };
        if header.data_len != 0 && !header.kind.carries_data() {
            return Err(RecordError::InvalidHeader);
        }
        if header.record_len() != plain.len() {
            return Err(RecordError::InvalidHeader);
        }
        Ok(header)
    }

    pub(super) fn write(self, buf: &mut impl BufMut) {
        buf.put_u16(self.data_len);
        buf.put_u8(self.padding_len);
        buf.put_u8(self.kind as u8);
    }

    pub(super) fn record_len(self) -> usize {
        HEADER_LEN + usize::from(self.data_len) + usize::from(self.padding_len)
    }
}
