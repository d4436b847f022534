//! L3 descriptor table (C4): opened-physical-file handles.

use crate::driver::NativeHandle;
use crate::error::{Error, Result};

use super::FIRST_VALID_INDEX;

/// One opened physical file (spec §3 "L3 descriptor entry").
pub struct L3Entry {
    pub resource_name: String,
    pub driver_kind: crate::driver::DriverKind,
    pub handle: NativeHandle,
    pub offset: i64,
    pub flags: crate::driver::OpenFlags,
}

/// Fixed-capacity table of [`L3Entry`] slots, keyed by integer index
/// (spec §4.4). Allocation is a linear scan for the first free slot;
/// indices below [`FIRST_VALID_INDEX`] are never handed out.
pub struct L3Table {
    slots: Vec<Option<L3Entry>>,
}

impl L3Table {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    /// Allocates a free slot and stores `entry` in it, returning the new
    /// index. Fails with [`Error::ResourceExhausted`] when the table is
    /// full (spec §4.4).
    pub fn allocate(&mut self, entry: L3Entry) -> Result<i32> {
        let start = FIRST_VALID_INDEX as usize;
        for (idx, slot) in self.slots.iter_mut().enumerate().skip(start) {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(idx as i32);
            }
        }
        Err(Error::ResourceExhausted("L3"))
    }

    pub fn get(&self, index: i32) -> Result<&L3Entry> {
        self.validate_index(index)?;
        self.slots[index as usize].as_ref().ok_or(Error::BadDescriptorIndex(index))
    }

    pub fn get_mut(&mut self, index: i32) -> Result<&mut L3Entry> {
        self.validate_index(index)?;
        self.slots[index as usize].as_mut().ok_or(Error::BadDescriptorIndex(index))
    }

    /// Releases a slot, returning its entry so the caller can run the
    /// driver's `close` before dropping it.
    pub fn release(&mut self, index: i32) -> Result<L3Entry> {
        self.validate_index(index)?;
        self.slots[index as usize].take().ok_or(Error::BadDescriptorIndex(index))
    }

    pub fn is_in_use(&self, index: i32) -> bool {
        self.validate_index(index).is_ok() && self.slots[index as usize].is_some()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn validate_index(&self, index: i32) -> Result<()> {
        if index < FIRST_VALID_INDEX || index as usize >= self.slots.len() {
            return Err(Error::BadDescriptorIndex(index));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverKind, OpenFlags};

    fn dummy_entry() -> L3Entry {
        L3Entry {
            resource_name: "resc1".to_string(),
            driver_kind: DriverKind::Unix,
            handle: NativeHandle::Memory { data: Vec::new(), pos: 0 },
            offset: 0,
            flags: OpenFlags::read_only(),
        }
    }

    #[test]
    fn allocate_skips_reserved_indices() {
        let mut table = L3Table::new(8);
        let idx = table.allocate(dummy_entry()).unwrap();
        assert!(idx >= FIRST_VALID_INDEX);
    }

    #[test]
    fn index_below_two_is_rejected() {
        let table = L3Table::new(8);
        assert_eq!(table.get(0).unwrap_err(), Error::BadDescriptorIndex(0));
        assert_eq!(table.get(1).unwrap_err(), Error::BadDescriptorIndex(1));
    }

    #[test]
    fn index_at_capacity_is_rejected() {
        let table = L3Table::new(4);
        assert_eq!(table.get(4).unwrap_err(), Error::BadDescriptorIndex(4));
    }

    #[test]
    fn full_table_returns_resource_exhausted() {
        let mut table = L3Table::new(3); // capacity 3, indices 0,1 reserved -> only index 2 usable
        table.allocate(dummy_entry()).unwrap();
        let err = table.allocate(dummy_entry()).unwrap_err();
        assert_eq!(err, Error::ResourceExhausted("L3"));
    }

    #[test]
    fn release_frees_slot_for_reuse() {
        let mut table = L3Table::new(3);
        let idx = table.allocate(dummy_entry()).unwrap();
        table.release(idx).unwrap();
        assert!(!table.is_in_use(idx));
        table.allocate(dummy_entry()).unwrap();
    }
}
