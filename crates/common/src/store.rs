//! Parameter store interface and an in-memory implementation
//!
//! Every connected device owns a slot. Each slot has two streams:
//!
//! - `Data`: values reported by the device, written by the device handler
//!   and read by everyone else.
//! - `Command`: values requested by the executor or the network handler,
//!   read by the device handler and forwarded to the device.
//!
//! Writes to a `Command` stream mark the written parameters as pending. The
//! device handler polls [`ParamStore::pending_writes`] and, when it reads
//! the `Command` stream, the bits it read are cleared.

use crate::error::StoreError;
use protocol::{DeviceIdentity, ParamValues, mask_indices};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Number of devices the store can hold at once
pub const MAX_DEVICES: usize = 16;

/// Index of a device slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(pub usize);

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process accessing the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    DevHandler,
    Executor,
    NetHandler,
}

/// Which half of a slot is accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Data,
    Command,
}

/// Snapshot of outstanding command writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWrites {
    /// Bit `i` set when slot `i` has at least one pending parameter
    pub devices: u32,
    /// Pending parameter mask per slot
    pub params: [u32; MAX_DEVICES],
}

impl PendingWrites {
    /// Pending parameter mask for one slot
    pub fn for_slot(&self, slot: SlotIndex) -> u32 {
        self.params.get(slot.0).copied().unwrap_or(0)
    }
}

/// Shared parameter store used by the device relays
pub trait ParamStore: Send + Sync {
    /// Claim a slot for a freshly handshaken device
    fn connect(&self, identity: DeviceIdentity) -> Result<SlotIndex, StoreError>;

    /// Release a slot, discarding its values and pending writes
    fn disconnect(&self, slot: SlotIndex) -> Result<(), StoreError>;

    /// Read the parameters selected by `mask`
    ///
    /// Only parameters that have been written are returned.
    fn read(
        &self,
        slot: SlotIndex,
        requester: Requester,
        stream: Stream,
        mask: u32,
    ) -> Result<ParamValues, StoreError>;

    /// Write the parameters of `values` selected by `mask`
    fn write(
        &self,
        slot: SlotIndex,
        requester: Requester,
        stream: Stream,
        mask: u32,
        values: &ParamValues,
    ) -> Result<(), StoreError>;

    /// Current pending command writes across all slots
    fn pending_writes(&self) -> PendingWrites;
}

#[derive(Debug, Default)]
struct Slot {
    identity: Option<DeviceIdentity>,
    data: ParamValues,
    command: ParamValues,
}

#[derive(Debug, Default)]
struct StoreInner {
    slots: [Slot; MAX_DEVICES],
    pending: PendingWrites,
}

impl StoreInner {
    fn connected(&mut self, slot: SlotIndex) -> Result<&mut Slot, StoreError> {
        let entry = self
            .slots
            .get_mut(slot.0)
            .ok_or(StoreError::InvalidSlot(slot))?;
        if entry.identity.is_none() {
            return Err(StoreError::NotConnected(slot));
        }
        Ok(entry)
    }
}

/// Process-local [`ParamStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identities of all connected devices, by slot
    pub fn identities(&self) -> Vec<(SlotIndex, DeviceIdentity)> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.identity.map(|id| (SlotIndex(i), id)))
            .collect()
    }

    /// Bit `i` set when slot `i` holds a connected device
    pub fn connected_mask(&self) -> u32 {
        self.identities()
            .iter()
            .fold(0, |mask, (slot, _)| mask | (1 << slot.0))
    }
}

impl ParamStore for MemoryStore {
    fn connect(&self, identity: DeviceIdentity) -> Result<SlotIndex, StoreError> {
        let mut inner = self.lock();
        let index = inner
            .slots
            .iter()
            .position(|slot| slot.identity.is_none())
            .ok_or(StoreError::NoFreeSlot(MAX_DEVICES))?;

        inner.slots[index] = Slot {
            identity: Some(identity),
            ..Slot::default()
        };
        inner.pending.params[index] = 0;
        inner.pending.devices &= !(1 << index);
        Ok(SlotIndex(index))
    }

    fn disconnect(&self, slot: SlotIndex) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.connected(slot)?;
        inner.slots[slot.0] = Slot::default();
        inner.pending.params[slot.0] = 0;
        inner.pending.devices &= !(1 << slot.0);
        Ok(())
    }

    fn read(
        &self,
        slot: SlotIndex,
        requester: Requester,
        stream: Stream,
        mask: u32,
    ) -> Result<ParamValues, StoreError> {
        let mut inner = self.lock();
        let entry = inner.connected(slot)?;
        let source = match stream {
            Stream::Data => &entry.data,
            Stream::Command => &entry.command,
        };
        let values: ParamValues = mask_indices(mask)
            .filter_map(|index| source.get(&index).map(|v| (index, *v)))
            .collect();

        if requester == Requester::DevHandler && stream == Stream::Command {
            let remaining = inner.pending.params[slot.0] & !mask;
            inner.pending.params[slot.0] = remaining;
            if remaining == 0 {
                inner.pending.devices &= !(1 << slot.0);
            }
        }
        Ok(values)
    }

    fn write(
        &self,
        slot: SlotIndex,
        requester: Requester,
        stream: Stream,
        mask: u32,
        values: &ParamValues,
    ) -> Result<(), StoreError> {
        if requester == Requester::DevHandler && stream == Stream::Command {
            return Err(StoreError::PermissionDenied { requester, stream });
        }

        let mut inner = self.lock();
        let entry = inner.connected(slot)?;
        let target = match stream {
            Stream::Data => &mut entry.data,
            Stream::Command => &mut entry.command,
        };
        let mut written = 0u32;
        for index in mask_indices(mask) {
            if let Some(value) = values.get(&index) {
                target.insert(index, *value);
                written |= 1 << index;
            }
        }

        if stream == Stream::Command && written != 0 {
            inner.pending.params[slot.0] |= written;
            inner.pending.devices |= 1 << slot.0;
        }
        Ok(())
    }

    fn pending_writes(&self) -> PendingWrites {
        self.lock().pending
    }
}
