//! First-page file metadata.
//!
//! Page 0 holds an array of 32 fixed 64-byte `CowRegion` slots, each naming
//! one map and carrying its atomic root pointer, followed by the allocator
//! header. The root word is the linearisation point of every mutable-trie
//! operation.

use bytemuck::{Pod, Zeroable};

use crate::error::{DbError, Result};
use crate::region::Pin;

pub const NUM_SLOTS: usize = 32;
pub const SLOT_SIZE: u64 = 64;

/// Allocator header location, right after the slot array.
pub const ALLOC_HEADER_OFF: u64 = NUM_SLOTS as u64 * SLOT_SIZE;

pub const SLOT_MAGIC: u64 = 0x434F_5752_4547_4E00; // "COWREGN\0"
pub const SLOT_VERSION: u64 = 1;

/// One copy-on-write structure within the file.
///
/// `type_` is a spare field kept in the layout for forward compatibility;
/// it is written as zero and never interpreted.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CowRegion {
    pub version: u64,
    pub magic: u64,
    pub gc_data: [u64; 2],
    pub type_: u64,
    pub root: u64,
    pub name: [u8; 16],
}

const ROOT_FIELD_OFF: u64 = 40;

pub fn slot_offset(slot: usize) -> u64 {
    debug_assert!(slot < NUM_SLOTS);
    slot as u64 * SLOT_SIZE
}

/// Offset of the slot's atomic root word.
pub fn root_offset(slot: usize) -> u64 {
    slot_offset(slot) + ROOT_FIELD_OFF
}

pub fn read_slot(pin: &Pin, slot: usize) -> CowRegion {
    pin.read(slot_offset(slot))
}

pub fn write_slot(pin: &Pin, slot: usize, value: &CowRegion) {
    pin.write(slot_offset(slot), value);
}

/// Zero the whole slot array. Only called when creating a new file.
pub fn format(pin: &Pin) {
    for slot in 0..NUM_SLOTS {
        write_slot(pin, slot, &CowRegion::zeroed());
    }
}

/// Check that every in-use slot looks like one of ours.
pub fn validate(pin: &Pin) -> Result<()> {
    for slot in 0..NUM_SLOTS {
        let region = read_slot(pin, slot);
        if region.magic == 0 {
            continue;
        }
        if region.magic != SLOT_MAGIC {
            return Err(DbError::DataFormat("metadata slot magic mismatch"));
        }
        if region.version != SLOT_VERSION {
            return Err(DbError::DataFormat("metadata slot version mismatch"));
        }
    }
    Ok(())
}

pub fn is_allocated(pin: &Pin, slot: usize) -> bool {
    read_slot(pin, slot).magic == SLOT_MAGIC
}

/// Claim a slot for a new map. The slot must be free.
pub fn allocate_slot(pin: &Pin, slot: usize, name: &str) {
    let existing = read_slot(pin, slot);
    assert_eq!(existing.magic, 0, "metadata slot {slot} is already in use");

    let mut region = CowRegion::zeroed();
    region.version = SLOT_VERSION;
    region.magic = SLOT_MAGIC;
    let bytes = name.as_bytes();
    let n = bytes.len().min(region.name.len());
    region.name[..n].copy_from_slice(&bytes[..n]);
    write_slot(pin, slot, &region);
}

/// Release a slot. The map must have been cleared first.
pub fn deallocate_slot(pin: &Pin, slot: usize) {
    let existing = read_slot(pin, slot);
    assert_eq!(existing.magic, SLOT_MAGIC, "deallocating a free slot");
    assert_eq!(
        existing.root, 0,
        "deallocating metadata slot {slot} with a live root"
    );
    write_slot(pin, slot, &CowRegion::zeroed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::GcLock;
    use crate::region::{page_size, Region};
    use std::sync::Arc;

    #[test]
    fn slot_layout_is_fixed() {
        assert_eq!(std::mem::size_of::<CowRegion>(), SLOT_SIZE as usize);
        assert_eq!(std::mem::offset_of!(CowRegion, root), ROOT_FIELD_OFF as usize);
        assert_eq!(root_offset(0) % 8, 0);
    }

    #[test]
    fn allocate_and_free_slots() {
        let region = Region::anonymous(Arc::new(GcLock::new()), 4 * page_size()).unwrap();
        let pin = region.pin();
        format(&pin);
        validate(&pin).unwrap();

        allocate_slot(&pin, 3, "index");
        assert!(is_allocated(&pin, 3));
        assert!(!is_allocated(&pin, 4));
        let slot = read_slot(&pin, 3);
        assert_eq!(&slot.name[..5], b"index");
        validate(&pin).unwrap();

        deallocate_slot(&pin, 3);
        assert!(!is_allocated(&pin, 3));
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn double_allocate_panics() {
        let region = Region::anonymous(Arc::new(GcLock::new()), 4 * page_size()).unwrap();
        let pin = region.pin();
        format(&pin);
        allocate_slot(&pin, 0, "a");
        allocate_slot(&pin, 0, "b");
    }
}
