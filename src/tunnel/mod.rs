//! Multiplex layer packing many virtual connections into one record stream.
//!
//! Every record-layer packet starts with a fixed header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |S|D|F|R|       |         Connection ID         |
//! |     (= 1)     |Y|A|I|S|       |                               |
//! |               |N|T|N|T|       |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! followed by the raw payload, which is empty unless `DAT` is set.
//! Flags combine freely; the receiver applies `RST` first (and nothing
//! else), then `SYN`, `DAT` and finally `FIN`.

mod control;
mod packet;

pub use control::Control;
pub use packet::{ConnId, Packet, encode};
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Version written into every header.
pub const VERSION: u8 = 1;

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 4;

const_assert_eq!(HEADER_LEN, 1 + 1 + size_of::<u16>());

/// Errors raised while decoding a multiplex packet.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than a header were supplied.
    #[error("packet of {0} bytes is shorter than the multiplex header")]
    Truncated(usize),
    /// The header carried a version this implementation does not speak.
    #[error("unsupported multiplex version {0}")]
    UnsupportedVersion(u8),
}
