//! Metric helpers for `usocks`.
//!
//! Thin wrappers over the [`metrics`](https://docs.rs/metrics) macros. With
//! the `metrics` feature disabled every helper compiles to nothing.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Gauge of live record layers.
pub const RECORD_LAYERS_ACTIVE: &str = "usocks_record_layers_active";
/// Gauge of live virtual connections.
pub const VIRTUAL_CONNECTIONS_ACTIVE: &str = "usocks_virtual_connections_active";
/// Counter of multiplexed packets, labelled by direction.
pub const PACKETS_TOTAL: &str = "usocks_packets_total";
/// Counter of handled errors, labelled by kind.
pub const ERRORS_TOTAL: &str = "usocks_errors_total";

/// Direction of a multiplexed packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Received from a peer.
    Inbound,
    /// Sent to a peer.
    Outbound,
}

impl Direction {
    /// Label value used for this direction.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Set the live record layer gauge.
#[cfg_attr(not(feature = "metrics"), expect(unused_variables, reason = "metrics disabled"))]
pub fn set_record_layers(count: usize) {
    #[cfg(feature = "metrics")]
    gauge!(RECORD_LAYERS_ACTIVE).set(as_gauge(count));
}

/// Set the live virtual connection gauge.
#[cfg_attr(not(feature = "metrics"), expect(unused_variables, reason = "metrics disabled"))]
pub fn set_virtual_connections(count: usize) {
    #[cfg(feature = "metrics")]
    gauge!(VIRTUAL_CONNECTIONS_ACTIVE).set(as_gauge(count));
}

/// Record a packet travelling in `direction`.
#[cfg_attr(not(feature = "metrics"), expect(unused_variables, reason = "metrics disabled"))]
pub fn inc_packets(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(PACKETS_TOTAL, "direction" => direction.as_str()).increment(1);
}

/// Record an error of the given kind.
#[cfg_attr(not(feature = "metrics"), expect(unused_variables, reason = "metrics disabled"))]
pub fn inc_errors(kind: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL, "kind" => kind).increment(1);
}

#[cfg(feature = "metrics")]
#[expect(
    clippy::cast_precision_loss,
    reason = "connection counts stay far below 2^52"
)]
fn as_gauge(count: usize) -> f64 { count as f64 }
