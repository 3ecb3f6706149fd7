//! Registry of live record layers and the virtual connections they own.
//!
//! Objects are addressed by stable handles ([`RecordId`], [`VirtualId`])
//! handed out from a monotonic counter, so a handle can never alias a
//! connection created later. Two maps are kept in step:
//!
//! - record layer → (connection id → virtual connection)
//! - virtual connection → (connection id, owning record layer)
//!
//! The registry only mutates data structures. Closing frontends and
//! transports is left to the caller, which receives ownership of every
//! object removed from here.

use std::{collections::HashMap, fmt};

use thiserror::Error;

use crate::tunnel::ConnId;

/// Handle of a registered record layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u64);

impl RecordId {
    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(self) -> u64 { self.0 }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "RecordId({})", self.0) }
}

/// Handle of a registered virtual connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualId(u64);

impl VirtualId {
    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(self) -> u64 { self.0 }
}

impl fmt::Display for VirtualId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "VirtualId({})", self.0) }
}

/// Lookups against handles that are not registered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// No record layer is registered under the handle.
    #[error("{0} is not registered")]
    UnknownRecordLayer(RecordId),
    /// No virtual connection is registered under the handle.
    #[error("{0} is not registered")]
    UnknownVirtual(VirtualId),
}

struct RecordSlot<R> {
    layer: R,
    conns: HashMap<ConnId, VirtualId>,
}

struct VirtualSlot<V> {
    handle: V,
    conn_id: ConnId,
    owner: RecordId,
}

/// Everything removed by [`Registry::unregister_record_layer`].
pub struct Unregistered<R, V> {
    /// The record layer itself.
    pub layer: R,
    /// Virtual connections it owned, for the caller to close.
    pub virtuals: Vec<(VirtualId, V)>,
}

/// Paired mappings between record layers and virtual connections.
///
/// `R` is the stored record-layer object and `V` the stored frontend.
pub struct Registry<R, V> {
    next_id: u64,
    records: HashMap<RecordId, RecordSlot<R>>,
    virtuals: HashMap<VirtualId, VirtualSlot<V>>,
}

impl<R, V> Default for Registry<R, V> {
    fn default() -> Self {
        Self {
            next_id: 0,
            records: HashMap::new(),
            virtuals: HashMap::new(),
        }
    }
}

impl<R, V> Registry<R, V> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Add a record layer with no virtual connections.
    pub fn register_record_layer(&mut self, layer: R) -> RecordId {
        let id = RecordId(self.allocate());
        self.records.insert(
            id,
            RecordSlot {
                layer,
                conns: HashMap::new(),
            },
        );
        id
    }

    /// Remove a record layer together with every virtual connection it owns.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownRecordLayer`] if `id` is absent.
    pub fn unregister_record_layer(
        &mut self,
        id: RecordId,
    ) -> Result<Unregistered<R, V>, RegistryError> {
        let slot = self
            .records
            .remove(&id)
            .ok_or(RegistryError::UnknownRecordLayer(id))?;
        let virtuals = slot
            .conns
            .into_values()
            .filter_map(|vid| self.virtuals.remove(&vid).map(|v| (vid, v.handle)))
            .collect();
        Ok(Unregistered {
            layer: slot.layer,
            virtuals,
        })
    }

    /// Register `handle` under `conn_id` of record layer `owner`.
    ///
    /// Callers are expected to close any previous occupant first. Should
    /// one still be present it is unregistered and handed back so that no
    /// reverse mapping is left dangling.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownRecordLayer`] if `owner` is absent.
    pub fn open_virtual(
        &mut self,
        owner: RecordId,
        conn_id: ConnId,
        handle: V,
    ) -> Result<(VirtualId, Option<(VirtualId, V)>), RegistryError> {
        if !self.records.contains_key(&owner) {
            return Err(RegistryError::UnknownRecordLayer(owner));
        }
        let id = VirtualId(self.allocate());
        let slot = self
            .records
            .get_mut(&owner)
            .ok_or(RegistryError::UnknownRecordLayer(owner))?;
        let displaced = slot
            .conns
            .insert(conn_id, id)
            .and_then(|prev| self.virtuals.remove(&prev).map(|v| (prev, v.handle)));
        self.virtuals.insert(
            id,
            VirtualSlot {
                handle,
                conn_id,
                owner,
            },
        );
        Ok((id, displaced))
    }

    /// Find the connection id and owner of a virtual connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownVirtual`] if `id` is absent.
    pub fn lookup_owner(&self, id: VirtualId) -> Result<(ConnId, RecordId), RegistryError> {
        self.virtuals
            .get(&id)
            .map(|slot| (slot.conn_id, slot.owner))
            .ok_or(RegistryError::UnknownVirtual(id))
    }

    /// Find the virtual connection occupying `conn_id` under `owner`.
    #[must_use]
    pub fn lookup_virtual(&self, owner: RecordId, conn_id: ConnId) -> Option<VirtualId> {
        self.records
            .get(&owner)
            .and_then(|slot| slot.conns.get(&conn_id).copied())
    }

    /// Remove both mappings of a virtual connection and return its handle.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownVirtual`] if `id` is absent, which
    /// includes closing the same connection twice.
    pub fn close_virtual(&mut self, id: VirtualId) -> Result<V, RegistryError> {
        let slot = self
            .virtuals
            .remove(&id)
            .ok_or(RegistryError::UnknownVirtual(id))?;
        if let Some(record) = self.records.get_mut(&slot.owner)
            && record.conns.get(&slot.conn_id) == Some(&id)
        {
            record.conns.remove(&slot.conn_id);
        }
        Ok(slot.handle)
    }

    /// Returns `true` if the record layer is registered.
    #[must_use]
    pub fn contains_record(&self, id: RecordId) -> bool { self.records.contains_key(&id) }

    /// Returns `true` if the virtual connection is registered.
    #[must_use]
    pub fn contains_virtual(&self, id: VirtualId) -> bool { self.virtuals.contains_key(&id) }

    /// Mutable access to a record layer.
    pub fn record_mut(&mut self, id: RecordId) -> Option<&mut R> {
        self.records.get_mut(&id).map(|slot| &mut slot.layer)
    }

    /// Mutable access to a virtual connection's handle.
    pub fn virtual_mut(&mut self, id: VirtualId) -> Option<&mut V> {
        self.virtuals.get_mut(&id).map(|slot| &mut slot.handle)
    }

    /// Iterate over every record layer.
    pub fn records_mut(&mut self) -> impl Iterator<Item = (RecordId, &mut R)> {
        self.records.iter_mut().map(|(id, slot)| (*id, &mut slot.layer))
    }

    /// Iterate over every virtual connection.
    pub fn virtuals_mut(&mut self) -> impl Iterator<Item = (VirtualId, &mut V)> {
        self.virtuals
            .iter_mut()
            .map(|(id, slot)| (*id, &mut slot.handle))
    }

    /// Handles of every registered record layer.
    #[must_use]
    pub fn record_ids(&self) -> Vec<RecordId> { self.records.keys().copied().collect() }

    /// Connection ids currently open under `owner`.
    #[must_use]
    pub fn conn_ids(&self, owner: RecordId) -> Vec<ConnId> {
        self.records
            .get(&owner)
            .map(|slot| slot.conns.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of registered record layers.
    #[must_use]
    pub fn record_count(&self) -> usize { self.records.len() }

    /// Number of registered virtual connections.
    #[must_use]
    pub fn virtual_count(&self) -> usize { self.virtuals.len() }
}
