//! Public API for the `usocks` tunnel server and client.
//!
//! A client opens an encrypted record-layer connection to the server and
//! multiplexes any number of virtual connections over it; the server
//! forwards each virtual connection to a frontend. Each side runs on a
//! single Tokio task driven by readiness events.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod frontend;
pub mod logging;
pub mod metrics;
pub mod mux;
pub mod nonblocking;
pub mod panic;
pub mod pending;
pub mod record;
pub mod registry;
pub mod server;
pub mod tunnel;

pub use client::TunnelClient;
pub use error::{Error, Result};
pub use mux::Multiplexer;
pub use record::{PresharedKey, RecordConnection, RecordLayer};
pub use server::TunnelServer;
pub use tunnel::{ConnId, Control, Packet};
