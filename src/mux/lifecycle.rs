//! Transitions of a virtual connection driven by inbound control flags.
//!
//! A connection id is either [`VirtualState::Unopened`] or
//! [`VirtualState::Open`] within its record layer; closing returns it to
//! `Unopened`. Flags in one packet are applied in a fixed order: RST alone,
//! otherwise SYN, then DAT, then FIN.

use crate::tunnel::Control;

/// Whether a connection id is currently occupied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualState {
    /// No virtual connection is registered under the id.
    Unopened,
    /// A virtual connection is registered under the id.
    Open,
}

/// Steps to take for one inbound packet, in application order.
///
/// The executor stops early if opening a frontend fails or delivery
/// closes the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Reset the open connection and do nothing else.
    pub reset: bool,
    /// Gracefully close the connection currently holding the id.
    pub replace: bool,
    /// Create a new frontend for the id.
    pub open: bool,
    /// Hand the payload to the frontend.
    pub deliver: bool,
    /// Gracefully close after delivery.
    pub close: bool,
    /// Flags addressed an unopened id and are ignored.
    pub dropped: bool,
}

impl Plan {
    /// Decide what a packet carrying `control` does to an id in `state`.
    #[must_use]
    pub fn for_packet(control: Control, state: VirtualState) -> Self {
        let open_now = state == VirtualState::Open;
        if control.contains(Control::RST) {
            return Self {
                reset: open_now,
                dropped: !open_now,
                ..Self::default()
            };
        }
        let syn = control.contains(Control::SYN);
        let live = syn || open_now;
        let wants = control.intersects(Control::DAT | Control::FIN);
        Self {
            replace: syn && open_now,
            open: syn,
            deliver: live && control.contains(Control::DAT),
            close: live && control.contains(Control::FIN),
            dropped: !live && wants,
            ..Self::default()
        }
    }

    /// State the id ends up in if every step succeeds.
    #[must_use]
    pub fn outcome(self, state: VirtualState) -> VirtualState {
        if self.reset || self.close {
            VirtualState::Unopened
        } else if self.open {
            VirtualState::Open
        } else {
            state
        }
    }
}
