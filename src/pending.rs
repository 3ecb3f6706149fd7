//! Connections with output that has not been fully flushed yet.
//!
//! Membership mirrors the outcome of the most recent send attempt: an
//! endpoint joins when a send reports partial completion and leaves when
//! a retry drains it. Teardown paths remove endpoints explicitly so the
//! set never refers to a destroyed connection.

use std::collections::BTreeSet;

use crate::registry::{RecordId, VirtualId};

/// A connection that takes part in readiness polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    /// A record-layer connection.
    Record(RecordId),
    /// A virtual connection backed by a frontend.
    Virtual(VirtualId),
}

/// Set of endpoints awaiting write readiness.
#[derive(Debug, Default)]
pub struct PendingWrites(BTreeSet<Endpoint>);

impl PendingWrites {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Mark `endpoint` as pending. Adding twice has no further effect.
    ///
    /// Returns `true` if the endpoint was not already pending.
    pub fn add(&mut self, endpoint: Endpoint) -> bool { self.0.insert(endpoint) }

    /// Forget `endpoint`. Returns `true` if it was pending.
    pub fn remove(&mut self, endpoint: Endpoint) -> bool { self.0.remove(&endpoint) }

    /// Returns `true` if `endpoint` is pending.
    #[must_use]
    pub fn contains(&self, endpoint: Endpoint) -> bool { self.0.contains(&endpoint) }

    /// Iterate over the pending endpoints in a stable order.
    pub fn members(&self) -> impl Iterator<Item = Endpoint> + '_ { self.0.iter().copied() }

    /// Number of pending endpoints.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn endpoints() -> (Endpoint, Endpoint) {
        let mut registry: Registry<(), ()> = Registry::new();
        let rid = registry.register_record_layer(());
        let (vid, _) = registry
            .open_virtual(rid, crate::tunnel::ConnId::new(1), ())
            .expect("owner registered");
        (Endpoint::Record(rid), Endpoint::Virtual(vid))
    }

    #[test]
    fn adding_twice_keeps_one_entry() {
        let (record, _) = endpoints();
        let mut pending = PendingWrites::new();
        assert!(pending.add(record));
        assert!(!pending.add(record));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn removal_is_exact() {
        let (record, virt) = endpoints();
        let mut pending = PendingWrites::new();
        pending.add(record);
        pending.add(virt);
        assert!(pending.remove(virt));
        assert!(!pending.remove(virt));
        assert_eq!(pending.members().collect::<Vec<_>>(), vec![record]);
        assert!(pending.remove(record));
        assert!(pending.is_empty());
    }
}
