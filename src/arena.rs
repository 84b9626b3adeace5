//! The region-internal allocator.
//!
//! Power-of-two segregated free lists whose class heads persist in the
//! header page, right after the metadata slots. Each block starts with an
//! 8-byte header carrying the size class, so `deallocate` and `size_of`
//! need nothing but the offset. Free blocks chain through their first
//! payload word.
//!
//! Allocation may block briefly (one mutex) and may grow the region in
//! place; a growth that would move the mapping surfaces as a restart fault
//! for the caller to retry under the exclusive lock.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::trace;
use parking_lot::Mutex;

use crate::error::{DbError, OpResult};
use crate::meta;
use crate::region::{page_size, Pin, Region};

const ALLOC_MAGIC: u64 = 0x6461_7364_625F_6172; // "dasdb_ar"
const BLOCK_MAGIC: u64 = 0xB10C;

const MIN_CLASS_SHIFT: u32 = 4; // 16 bytes
const MAX_CLASS_SHIFT: u32 = 20; // 1 MiB
const NUM_CLASSES: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

const BLOCK_HEADER: u64 = 8;

/// Lives in the header page at [`meta::ALLOC_HEADER_OFF`].
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct AllocHeader {
    magic: u64,
    next_free: u64,
    outstanding: u64,
    class_heads: [u64; NUM_CLASSES],
}

fn class_of(total: u64) -> Option<usize> {
    let mut shift = MIN_CLASS_SHIFT;
    while shift <= MAX_CLASS_SHIFT {
        if total <= (1 << shift) {
            return Some((shift - MIN_CLASS_SHIFT) as usize);
        }
        shift += 1;
    }
    None
}

fn class_size(class: usize) -> u64 {
    1 << (class as u32 + MIN_CLASS_SHIFT)
}

pub struct Arena {
    region: Arc<Region>,
    lock: Mutex<()>,
}

impl Arena {
    pub fn new(region: Arc<Region>) -> Arena {
        Arena {
            region,
            lock: Mutex::new(()),
        }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Set up a fresh header. Only called when creating a new file.
    pub fn format(&self, pin: &Pin) {
        let header = AllocHeader {
            magic: ALLOC_MAGIC,
            next_free: page_size(),
            outstanding: 0,
            class_heads: [0; NUM_CLASSES],
        };
        pin.write(meta::ALLOC_HEADER_OFF, &header);
    }

    pub fn validate(&self, pin: &Pin) -> Result<(), DbError> {
        let header: AllocHeader = pin.read(meta::ALLOC_HEADER_OFF);
        if header.magic != ALLOC_MAGIC {
            return Err(DbError::DataFormat("allocator header magic mismatch"));
        }
        Ok(())
    }

    /// Allocate `size` bytes; returns the payload offset.
    pub fn allocate(&self, pin: &Pin, size: u64) -> OpResult<u64> {
        let class = class_of(size + BLOCK_HEADER).ok_or(DbError::OutOfSpace {
            requested: size,
        })?;
        let _guard = self.lock.lock();
        let mut header: AllocHeader = pin.read(meta::ALLOC_HEADER_OFF);

        let block = if header.class_heads[class] != 0 {
            let block = header.class_heads[class];
            header.class_heads[class] = pin.read::<u64>(block + BLOCK_HEADER);
            block
        } else {
            let block = (header.next_free + 15) & !15;
            let end = block + class_size(class);
            if end > self.region.length() {
                // Drop our header changes; nothing was committed yet.
                self.region.grow_for(end)?;
            }
            header.next_free = end;
            block
        };

        header.outstanding += class_size(class);
        pin.write(meta::ALLOC_HEADER_OFF, &header);
        pin.write::<u64>(block, &((BLOCK_MAGIC << 16) | class as u64));
        trace!("allocate {} bytes -> {:#x} (class {})", size, block, class);
        Ok(block + BLOCK_HEADER)
    }

    /// Return a payload offset to its free list.
    pub fn deallocate(&self, pin: &Pin, payload: u64) {
        let block = payload - BLOCK_HEADER;
        let tag: u64 = pin.read(block);
        assert_eq!(tag >> 16, BLOCK_MAGIC, "deallocate of a non-block offset");
        let class = (tag & 0xffff) as usize;
        assert!(class < NUM_CLASSES, "corrupt block class");

        let _guard = self.lock.lock();
        let mut header: AllocHeader = pin.read(meta::ALLOC_HEADER_OFF);
        pin.write::<u64>(block, &0); // poison the tag
        pin.write::<u64>(block + BLOCK_HEADER, &header.class_heads[class]);
        header.class_heads[class] = block;
        header.outstanding -= class_size(class);
        pin.write(meta::ALLOC_HEADER_OFF, &header);
    }

    /// Usable payload size of an allocation.
    pub fn size_of(&self, pin: &Pin, payload: u64) -> u64 {
        let tag: u64 = pin.read(payload - BLOCK_HEADER);
        assert_eq!(tag >> 16, BLOCK_MAGIC, "size_of of a non-block offset");
        class_size((tag & 0xffff) as usize) - BLOCK_HEADER
    }

    /// Bytes currently allocated, block headers included.
    pub fn bytes_outstanding(&self, pin: &Pin) -> u64 {
        let header: AllocHeader = pin.read(meta::ALLOC_HEADER_OFF);
        header.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::GcLock;

    fn arena() -> Arena {
        let region = Region::anonymous(Arc::new(GcLock::new()), 16 * page_size()).unwrap();
        let arena = Arena::new(region);
        {
            let pin = arena.region.pin();
            arena.format(&pin);
        }
        arena
    }

    #[test]
    fn allocate_roundtrip() {
        let arena = arena();
        let pin = arena.region.pin();
        let a = arena.allocate(&pin, 24).unwrap();
        let b = arena.allocate(&pin, 24).unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.size_of(&pin, a), 24);
        pin.write::<u64>(a, &123);
        pin.write::<u64>(b, &456);
        assert_eq!(pin.read::<u64>(a), 123);
        assert_eq!(pin.read::<u64>(b), 456);
    }

    #[test]
    fn freelist_reuses_blocks() {
        let arena = arena();
        let pin = arena.region.pin();
        let a = arena.allocate(&pin, 100).unwrap();
        arena.deallocate(&pin, a);
        let b = arena.allocate(&pin, 100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn outstanding_accounting() {
        let arena = arena();
        let pin = arena.region.pin();
        let base = arena.bytes_outstanding(&pin);
        let a = arena.allocate(&pin, 24).unwrap();
        let b = arena.allocate(&pin, 500).unwrap();
        assert_eq!(arena.bytes_outstanding(&pin), base + 32 + 512);
        arena.deallocate(&pin, a);
        arena.deallocate(&pin, b);
        assert_eq!(arena.bytes_outstanding(&pin), base);
    }

    #[test]
    fn grows_the_region_when_full() {
        use crate::error::Fault;
        let arena = arena();
        // 16 MiB worth of 16 KiB blocks against a 64 KiB region: must grow,
        // restarting under the exclusive lock when it can't do so in place.
        for _ in 0..1000 {
            loop {
                let pin = arena.region.pin();
                match arena.allocate(&pin, 16 * 1024 - 8) {
                    Ok(_) => break,
                    Err(Fault::Restart(len)) => {
                        drop(pin);
                        arena.region.resize_moving(len).unwrap();
                    }
                    Err(Fault::Error(e)) => panic!("{e}"),
                }
            }
        }
        assert!(arena.region.length() >= 16 << 20);
    }

    #[test]
    fn rejects_oversized_allocations() {
        let arena = arena();
        let pin = arena.region.pin();
        assert!(arena.allocate(&pin, 2 << 20).is_err());
    }
}
