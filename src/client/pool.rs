//! Allocation of connection ids for locally accepted connections.

use crate::tunnel::ConnId;

/// Free connection ids, `1..=u16::MAX`.
///
/// Fresh ids are handed out in ascending order; released ids are reused
/// most recent first before any fresh one.
#[derive(Debug)]
pub struct ConnIdPool {
    next: Option<u16>,
    released: Vec<ConnId>,
}

impl Default for ConnIdPool {
    fn default() -> Self {
        Self {
            next: Some(1),
            released: Vec::new(),
        }
    }
}

impl ConnIdPool {
    /// Create a pool with every id free.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Take a free id, or `None` when all are in use.
    pub fn allocate(&mut self) -> Option<ConnId> {
        if let Some(id) = self.released.pop() {
            return Some(id);
        }
        let id = self.next?;
        self.next = id.checked_add(1);
        Some(ConnId::new(id))
    }

    /// Return `id` to the pool.
    pub fn release(&mut self, id: ConnId) { self.released.push(id); }
}
