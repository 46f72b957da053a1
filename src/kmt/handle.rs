//! Opaque driver handles backed by a generational arena.
//!
//! A handle packs the slot index (plus one, so that zero stays the null handle) into the
//! low 20 bits and the slot generation into the high 12 bits. Destroying an object bumps the
//! generation of its slot, so a stale handle never validates against a reused slot. A slot
//! whose generation is exhausted is retired for good rather than wrapping back to zero.

use crate::error::{KmtError, KmtResult};
use std::fmt;

const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << (32 - INDEX_BITS)) - 1;

/// Largest number of live objects a single table can hold.
pub const MAX_HANDLES: usize = INDEX_MASK as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KmtHandle(u32);

impl KmtHandle {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn compose(index: usize, generation: u32) -> Self {
        Self(((generation & GENERATION_MASK) << INDEX_BITS) | (index as u32 + 1))
    }

    const fn index(self) -> Option<usize> {
        match self.0 & INDEX_MASK {
            0 => None,
            i => Some(i as usize - 1),
        }
    }

    const fn generation(self) -> u32 {
        self.0 >> INDEX_BITS
    }
}

impl fmt::Display for KmtHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// The object family a handle was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Adapter,
    Device,
    Context,
    Resource,
    Allocation,
    PagingQueue,
    SyncObject,
    HwQueue,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Adapter => "adapter",
            Self::Device => "device",
            Self::Context => "context",
            Self::Resource => "resource",
            Self::Allocation => "allocation",
            Self::PagingQueue => "paging queue",
            Self::SyncObject => "sync object",
            Self::HwQueue => "hardware queue",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Maps handles to records. Lookups are O(1); freed slots are recycled LIFO.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
    capacity: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new(MAX_HANDLES)
    }
}

impl<T> HandleTable<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            capacity: capacity.min(MAX_HANDLES),
        }
    }

    /// Stores `value` and returns the handle that now names it.
    ///
    /// # Errors
    /// Returns `HandleTableFull` once `capacity` objects are live.
    pub fn insert(&mut self, value: T) -> KmtResult<KmtHandle> {
        if self.live >= self.capacity {
            return Err(KmtError::HandleTableFull);
        }

        let index = if let Some(index) = self.free.pop() {
            self.slots[index].value = Some(value);
            index
        } else if self.slots.len() >= MAX_HANDLES {
            return Err(KmtError::HandleTableFull);
        } else {
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            self.slots.len() - 1
        };

        self.live += 1;
        Ok(KmtHandle::compose(index, self.slots[index].generation))
    }

    fn slot_index(&self, handle: KmtHandle) -> Option<usize> {
        let index = handle.index()?;
        let slot = self.slots.get(index)?;
        (slot.generation == handle.generation() && slot.value.is_some()).then_some(index)
    }

    #[must_use]
    pub fn get(&self, handle: KmtHandle) -> Option<&T> {
        let index = self.slot_index(handle)?;
        self.slots[index].value.as_ref()
    }

    pub fn get_mut(&mut self, handle: KmtHandle) -> Option<&mut T> {
        let index = self.slot_index(handle)?;
        self.slots[index].value.as_mut()
    }

    #[must_use]
    pub fn contains(&self, handle: KmtHandle) -> bool {
        self.slot_index(handle).is_some()
    }

    /// Removes the record and retires the handle. The slot is recycled unless its generation is
    /// used up.
    pub fn remove(&mut self, handle: KmtHandle) -> Option<T> {
        let index = self.slot_index(handle)?;
        let slot = &mut self.slots[index];
        let value = slot.value.take();
        if slot.generation < GENERATION_MASK {
            slot.generation += 1;
            self.free.push(index);
        }
        self.live -= 1;
        value
    }

    pub fn iter(&self) -> impl Iterator<Item = (KmtHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (KmtHandle::compose(index, slot.generation), value))
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_handles_are_never_null() {
        let mut table = HandleTable::default();
        let handle = table.insert(7u32).unwrap();
        assert!(!handle.is_null());
        assert_eq!(table.get(handle), Some(&7));
    }

    #[test]
    fn null_handle_never_resolves() {
        let mut table = HandleTable::default();
        table.insert(1u32).unwrap();
        assert!(table.get(KmtHandle::NULL).is_none());
    }

    #[test]
    fn stale_handle_is_rejected_after_slot_reuse() {
        let mut table = HandleTable::default();
        let first = table.insert("first").unwrap();
        assert_eq!(table.remove(first), Some("first"));

        let second = table.insert("second").unwrap();
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert_eq!(table.get(second), Some(&"second"));
        assert!(table.remove(first).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = HandleTable::new(2);
        table.insert(()).unwrap();
        let h = table.insert(()).unwrap();
        assert!(matches!(table.insert(()), Err(KmtError::HandleTableFull)));
        table.remove(h);
        assert!(table.insert(()).is_ok());
    }

    #[test]
    fn iter_reports_live_handles() {
        let mut table = HandleTable::default();
        let a = table.insert(1).unwrap();
        let b = table.insert(2).unwrap();
        table.remove(a);
        let live: Vec<_> = table.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(live, vec![(b, 2)]);
    }

    #[test]
    fn exhausted_slot_is_never_reissued() {
        let mut table = HandleTable::default();
        let first = table.insert(0u32).unwrap();
        table.remove(first);

        let mut handle = table.insert(1u32).unwrap();
        for round in 2..=GENERATION_MASK + 1 {
            assert!(table.get(first).is_none());
            table.remove(handle);
            handle = table.insert(round).unwrap();
            assert_ne!(handle, first);
        }

        // Slot 0 ran through every generation; the table moved on to a fresh slot.
        assert_ne!(handle.index(), first.index());
        assert!(table.get(first).is_none());
        assert!(table.remove(first).is_none());
        assert_eq!(table.len(), 1);
    }
}
