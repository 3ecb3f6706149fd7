//! Test doubles and helpers for exercising `usocks` without real peers.
//!
//! The multiplexer is driven with [`mock_record_layer`] and [`MockFactory`],
//! whose probes record every call for later assertions. [`pipe`] provides
//! an in-memory transport for record-layer tests, and [`TunnelPeer`] plays
//! the client side of a real server over TCP.
//!
//! ```rust
//! use usocks::{ConnId, Control, Multiplexer, Packet};
//! use usocks_testing::{MockFactory, mock_record_layer};
//!
//! let frontends = MockFactory::new();
//! let mut mux = Multiplexer::new(frontends.factory());
//! let (layer, probe) = mock_record_layer("peer");
//! let id = mux.attach(Box::new(layer));
//!
//! probe.push_packets([Packet::new(Control::SYN | Control::DAT, ConnId::new(1), "hi".into())]);
//! mux.on_record_readable(id).unwrap();
//! assert_eq!(frontends.last().unwrap().received(), b"hi");
//! ```

pub mod echo;
pub mod frontend;
pub mod logging;
pub mod peer;
pub mod pipe;
pub mod record;

pub use echo::EchoServer;
pub use frontend::{FrontendEvent, FrontendProbe, MockFactory, MockFrontend};
pub use logging::{LoggerHandle, logger};
pub use peer::TunnelPeer;
pub use pipe::{PipeEnd, PipeTap, pipe};
pub use record::{MockRecordLayer, RecordProbe, mock_record_layer};
