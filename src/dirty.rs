//! Lock-free table of pages written since the last snapshot.
//!
//! The page index is split on its highest bit position into a group and a
//! subindex; group `g` covers `2^(g + MIN_GROUP_BITS - 1)` pages (group 0
//! covers the first `2^MIN_GROUP_BITS`). Groups are allocated on first use
//! with a compare-and-swap, so the table performs at most `GROUP_COUNT`
//! allocations over its lifetime while still growing with the region.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::region::page_size;

/// Group 0 tracks 512 pages: one cache line of bits, about 2 MiB of region.
const MIN_GROUP_BITS: usize = 9;
const GROUP_COUNT: usize = 20;

struct Group {
    pages: u64,
    table: Box<[AtomicU64]>,
}

impl Group {
    fn new(pages: u64) -> Group {
        let words = (pages / 64).max(1) as usize;
        let table = (0..words).map(|_| AtomicU64::new(0)).collect();
        Group { pages, table }
    }

    fn mark(&self, page: u64) {
        assert!(page < self.pages);
        let bit = 1u64 << (page % 64);
        self.table[(page / 64) as usize].fetch_or(bit, Ordering::SeqCst);
    }

    fn clear(&self, page: u64) -> bool {
        assert!(page < self.pages);
        let bit = 1u64 << (page % 64);
        let old = self.table[(page / 64) as usize].fetch_and(!bit, Ordering::SeqCst);
        old & bit != 0
    }

    fn next(&self, start: u64) -> Option<u64> {
        let mut index = (start / 64) as usize;
        let mut mask = !((1u64 << (start % 64)) - 1);
        while index < self.table.len() {
            let word = self.table[index].load(Ordering::SeqCst) & mask;
            if word != 0 {
                return Some(index as u64 * 64 + word.trailing_zeros() as u64);
            }
            mask = !0;
            index += 1;
        }
        None
    }
}

pub struct DirtyPageTable {
    groups: [AtomicPtr<Group>; GROUP_COUNT],
    page_shift: u32,
}

unsafe impl Send for DirtyPageTable {}
unsafe impl Sync for DirtyPageTable {}

impl DirtyPageTable {
    pub fn new(initial_size: u64) -> DirtyPageTable {
        let table = DirtyPageTable {
            groups: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            page_shift: page_size().trailing_zeros(),
        };
        let (max_group, _) = table.addr_to_index(initial_size.saturating_sub(1));
        for group in 0..=max_group {
            table.group(group);
        }
        table
    }

    fn group_pages(group: usize) -> u64 {
        if group == 0 {
            1 << MIN_GROUP_BITS
        } else {
            1 << (group + MIN_GROUP_BITS - 1)
        }
    }

    fn addr_to_index(&self, addr: u64) -> (usize, u64) {
        let page = addr >> self.page_shift;
        if page == 0 {
            return (0, 0);
        }
        let highest = 63 - page.leading_zeros() as usize;
        if highest < MIN_GROUP_BITS {
            return (0, page);
        }
        let group = highest - MIN_GROUP_BITS + 1;
        let subindex = page & ((1u64 << (group + MIN_GROUP_BITS - 1)) - 1);
        (group, subindex)
    }

    fn index_to_addr(&self, group: usize, subindex: u64) -> u64 {
        let head = if group == 0 {
            0
        } else {
            1u64 << (group + MIN_GROUP_BITS - 1)
        };
        (head | subindex) << self.page_shift
    }

    fn group(&self, group: usize) -> &Group {
        assert!(group < GROUP_COUNT, "region too large for the page table");
        let slot = &self.groups[group];
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let fresh = Box::into_raw(Box::new(Group::new(Self::group_pages(group))));
        match slot.compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // Lost the race; drop ours and use the winner's.
                unsafe { drop(Box::from_raw(fresh)) };
                unsafe { &*winner }
            }
        }
    }

    pub fn mark_page(&self, addr: u64) {
        let (group, subindex) = self.addr_to_index(addr);
        self.group(group).mark(subindex);
    }

    pub fn mark_pages(&self, start: u64, length: u64) {
        let page = 1u64 << self.page_shift;
        let mut at = start & !(page - 1);
        let end = start + length;
        while at < end {
            self.mark_page(at);
            at += page;
        }
    }

    /// Clear the page's bit; true iff it was set.
    pub fn clear_page(&self, addr: u64) -> bool {
        let (group, subindex) = self.addr_to_index(addr);
        let existing = self.groups[group].load(Ordering::Acquire);
        if existing.is_null() {
            return false;
        }
        unsafe { &*existing }.clear(subindex)
    }

    /// Lowest dirty page offset at or after `start`.
    pub fn next_page(&self, start: u64) -> Option<u64> {
        let (mut group, mut subindex) = self.addr_to_index(start);
        while group < GROUP_COUNT {
            let ptr = self.groups[group].load(Ordering::Acquire);
            if !ptr.is_null() {
                if let Some(page) = unsafe { &*ptr }.next(subindex) {
                    return Some(self.index_to_addr(group, page));
                }
            }
            subindex = 0;
            group += 1;
        }
        None
    }
}

impl Drop for DirtyPageTable {
    fn drop(&mut self) {
        for slot in &self.groups {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_scan() {
        let page = page_size();
        let table = DirtyPageTable::new(64 * page);

        table.mark_page(0);
        table.mark_page(3 * page);
        table.mark_page(40 * page);

        assert_eq!(table.next_page(0), Some(0));
        assert_eq!(table.next_page(1), Some(3 * page));
        assert_eq!(table.next_page(3 * page), Some(3 * page));
        assert_eq!(table.next_page(3 * page + 1), Some(40 * page));
        assert_eq!(table.next_page(40 * page + 1), None);
    }

    #[test]
    fn clear_reports_previous_state() {
        let page = page_size();
        let table = DirtyPageTable::new(16 * page);
        table.mark_page(5 * page);
        assert!(table.clear_page(5 * page));
        assert!(!table.clear_page(5 * page));
        assert_eq!(table.next_page(0), None);
    }

    #[test]
    fn grows_past_the_initial_size() {
        let page = page_size();
        let table = DirtyPageTable::new(4 * page);
        // Far beyond the initial size: allocates a higher group on demand.
        let far = 100_000 * page;
        table.mark_pages(far, 2 * page);
        assert_eq!(table.next_page(0), Some(far));
        assert_eq!(table.next_page(far + page), Some(far + page));
    }

    #[test]
    fn concurrent_marks() {
        use std::sync::Arc;
        let page = page_size();
        let table = Arc::new(DirtyPageTable::new(1024 * page));
        let mut handles = Vec::new();
        for t in 0..8 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..128u64 {
                    table.mark_page((t * 128 + i) * page);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut count = 0;
        let mut at = 0;
        while let Some(page_off) = table.next_page(at) {
            count += 1;
            at = page_off + page;
        }
        assert_eq!(count, 1024);
    }
}
