//! The memory region: a page-aligned, file-backed virtual memory range
//! shared by every component.
//!
//! The mapping is MAP_PRIVATE: stores stay in memory until a snapshot
//! pushes dirty pages through the journal, so the backing file always holds
//! the last snapshotted image. Offsets are stable across resizes; pointers
//! are only valid while a [`Pin`] is held. A resize that cannot proceed in
//! place surfaces as [`Fault::Restart`] and the enclosing operation retries
//! under the exclusive lock.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use memmap2::{MmapMut, MmapOptions, MmapRaw};
use parking_lot::{Mutex, RwLock};

use crate::dirty::DirtyPageTable;
use crate::epoch::{ExclusiveGuard, GcLock, SharedGuard};
use crate::error::{DbError, Fault, OpResult, Result};
use crate::lockfile::{self, NamedLock};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Permissions {
    Read,
    ReadWrite,
}

pub fn page_size() -> u64 {
    page_size::get() as u64
}

fn round_up_page(len: u64) -> u64 {
    let page = page_size();
    (len + page - 1) & !(page - 1)
}

struct Inner {
    map: MmapRaw,
    file: Option<File>,
}

pub struct Region {
    gc: Arc<GcLock>,
    inner: Mutex<Inner>,
    addr: AtomicUsize,
    /// Logical length; the mapping extends one hidden page further.
    len: AtomicU64,
    dirty: RwLock<Arc<DirtyPageTable>>,
    perm: Permissions,
    path: Option<PathBuf>,
    resize_lock: Option<NamedLock>,
}

impl Region {
    /// Map an anonymous region of at least `len` bytes.
    pub fn anonymous(gc: Arc<GcLock>, len: u64) -> Result<Arc<Region>> {
        let len = round_up_page(len.max(page_size()));
        let map_len = len + page_size();
        let map = MmapRaw::from(MmapMut::map_anon(map_len as usize).map_err(|e| {
            DbError::MapFailed {
                requested: map_len,
                source: e,
            }
        })?);
        Ok(Arc::new(Region {
            gc,
            addr: AtomicUsize::new(map.as_ptr() as usize),
            len: AtomicU64::new(len),
            dirty: RwLock::new(Arc::new(DirtyPageTable::new(len))),
            inner: Mutex::new(Inner { map, file: None }),
            perm: Permissions::ReadWrite,
            path: None,
            resize_lock: None,
        }))
    }

    /// Map `file` privately. The file must already be sized to a page
    /// multiple plus the hidden growth page.
    pub fn from_file(
        gc: Arc<GcLock>,
        file: File,
        path: &Path,
        perm: Permissions,
    ) -> Result<Arc<Region>> {
        let file_len = file.metadata().map_err(DbError::Open)?.len();
        let page = page_size();
        if file_len < 2 * page || (file_len % page) != 0 {
            return Err(DbError::DataFormat("file length is not page aligned"));
        }
        let len = file_len - page;

        let map = match perm {
            Permissions::ReadWrite => MmapRaw::from(unsafe {
                MmapOptions::new()
                    .len(file_len as usize)
                    .map_copy(&file)
                    .map_err(|e| DbError::MapFailed {
                        requested: file_len,
                        source: e,
                    })?
            }),
            Permissions::Read => MmapRaw::from(unsafe {
                MmapOptions::new()
                    .len(file_len as usize)
                    .map_copy_read_only(&file)
                    .map_err(|e| DbError::MapFailed {
                        requested: file_len,
                        source: e,
                    })?
            }),
        };

        let resize_lock = NamedLock::open(lockfile::resize_lock_path(path))?;

        Ok(Arc::new(Region {
            gc,
            addr: AtomicUsize::new(map.as_ptr() as usize),
            len: AtomicU64::new(len),
            dirty: RwLock::new(Arc::new(DirtyPageTable::new(len))),
            inner: Mutex::new(Inner {
                map,
                file: Some(file),
            }),
            perm,
            path: Some(path.to_owned()),
            resize_lock: Some(resize_lock),
        }))
    }

    pub fn gc(&self) -> &Arc<GcLock> {
        &self.gc
    }

    pub fn permissions(&self) -> Permissions {
        self.perm
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current logical length in bytes, a multiple of the page size.
    pub fn length(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.addr.load(Ordering::Acquire)
    }

    /// Pin the region: offsets may be converted to pointers until the pin
    /// drops. Pinning blocks moving resizes but not in-place growth.
    pub fn pin(&self) -> Pin<'_> {
        Pin {
            region: self,
            _guard: self.gc.lock_shared(),
        }
    }

    pub(crate) fn dirty_table(&self) -> Arc<DirtyPageTable> {
        self.dirty.read().clone()
    }

    /// Swap in a fresh dirty-page table, returning the old one. Caller must
    /// hold the exclusive lock so no mutation races the swap.
    pub(crate) fn swap_dirty(&self, _excl: &ExclusiveGuard<'_>) -> Arc<DirtyPageTable> {
        let fresh = Arc::new(DirtyPageTable::new(self.length()));
        std::mem::replace(&mut *self.dirty.write(), fresh)
    }

    /// Grow to at least `min_len` without moving the mapping, or signal a
    /// restart so the caller can retry under the exclusive lock.
    pub(crate) fn grow_for(&self, min_len: u64) -> OpResult<()> {
        if self.length() >= min_len {
            return Ok(());
        }
        if self.try_grow_in_place(min_len).map_err(Fault::Error)? {
            Ok(())
        } else {
            Err(Fault::Restart(min_len))
        }
    }

    fn try_grow_in_place(&self, min_len: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let cur = self.length();
        if cur >= min_len {
            return Ok(true);
        }
        let new_len = round_up_page(min_len.max(cur + cur / 2));
        let map_len = new_len + page_size();

        if let Some(file) = inner.file.as_ref() {
            file.set_len(map_len).map_err(|e| DbError::ResizeFailed {
                size: cur,
                requested: new_len,
                source: e,
            })?;
            file.sync_all().map_err(DbError::Sync)?;
        }

        // The hidden page at the end gives mremap a tail to extend without
        // fighting a concurrent snapshot for the adjacent VMA.
        #[cfg(target_os = "linux")]
        {
            use memmap2::RemapOptions;
            let res = unsafe {
                inner
                    .map
                    .remap(map_len as usize, RemapOptions::new().may_move(false))
            };
            if res.is_ok() {
                trace!("region grew in place to {:#x} bytes", new_len);
                self.len.store(new_len, Ordering::Release);
                return Ok(true);
            }
        }
        let _ = &mut inner;
        Ok(false)
    }

    /// Moving resize: acquires the inter-process resize lock and the
    /// exclusive region lock, then remaps. All offsets stay valid, all
    /// previously obtained pointers do not.
    pub(crate) fn resize_moving(&self, min_len: u64) -> Result<()> {
        if let Some(lock) = self.resize_lock.as_ref() {
            lock.lock()?;
        }
        let result = self.resize_moving_locked(min_len);
        if let Some(lock) = self.resize_lock.as_ref() {
            lock.unlock();
        }
        result
    }

    fn resize_moving_locked(&self, min_len: u64) -> Result<()> {
        let _excl = self.gc.lock_exclusive();
        let mut inner = self.inner.lock();
        let cur = self.length();
        if cur >= min_len {
            return Ok(());
        }
        let new_len = round_up_page(min_len.max(cur + cur / 2));
        let map_len = new_len + page_size();

        if let Some(file) = inner.file.as_ref() {
            file.set_len(map_len).map_err(|e| DbError::ResizeFailed {
                size: cur,
                requested: new_len,
                source: e,
            })?;
            file.sync_all().map_err(DbError::Sync)?;
        }

        #[cfg(target_os = "linux")]
        {
            use memmap2::RemapOptions;
            let res = unsafe {
                inner
                    .map
                    .remap(map_len as usize, RemapOptions::new().may_move(true))
            };
            if res.is_ok() {
                debug!(
                    "region moved: {:#x} -> {:#x} bytes at {:p}",
                    cur,
                    new_len,
                    inner.map.as_ptr()
                );
                self.addr.store(inner.map.as_ptr() as usize, Ordering::Release);
                self.len.store(new_len, Ordering::Release);
                return Ok(());
            }
        }

        // Fall back to a fresh private mapping. The old mapping's private
        // (unsnapshotted) pages must be carried over by hand.
        let new_map = match inner.file.as_ref() {
            Some(file) => MmapRaw::from(unsafe {
                MmapOptions::new()
                    .len(map_len as usize)
                    .map_copy(file)
                    .map_err(|e| DbError::MapFailed {
                        requested: map_len,
                        source: e,
                    })?
            }),
            None => MmapRaw::from(MmapMut::map_anon(map_len as usize).map_err(|e| {
                DbError::MapFailed {
                    requested: map_len,
                    source: e,
                }
            })?),
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                inner.map.as_ptr(),
                new_map.as_mut_ptr(),
                cur as usize,
            );
        }
        inner.map = new_map;
        debug!(
            "region remapped by copy: {:#x} -> {:#x} bytes at {:p}",
            cur,
            new_len,
            inner.map.as_ptr()
        );
        self.addr.store(inner.map.as_ptr() as usize, Ordering::Release);
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }

    /// Explicit resize; may shrink. Runs under the exclusive lock.
    pub fn resize(&self, new_len: u64) -> Result<()> {
        let new_len = round_up_page(new_len.max(page_size()));
        let cur = self.length();
        if new_len > cur {
            return self.resize_moving(new_len);
        }
        if new_len == cur {
            return Ok(());
        }
        let _excl = self.gc.lock_exclusive();
        let mut inner = self.inner.lock();
        let map_len = new_len + page_size();
        #[cfg(target_os = "linux")]
        {
            use memmap2::RemapOptions;
            unsafe {
                inner
                    .map
                    .remap(map_len as usize, RemapOptions::new().may_move(true))
            }
            .map_err(|e| DbError::MapFailed {
                requested: map_len,
                source: e,
            })?;
        }
        if let Some(file) = inner.file.as_ref() {
            file.set_len(map_len).map_err(|e| DbError::ResizeFailed {
                size: cur,
                requested: new_len,
                source: e,
            })?;
        }
        self.addr.store(inner.map.as_ptr() as usize, Ordering::Release);
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }
}

/*****************************************************************************/
/* PIN                                                                       */
/*****************************************************************************/

/// Scoped hold on the region. Offset-to-pointer conversion is only possible
/// through a pin, and nothing obtained from it may outlive it.
pub struct Pin<'r> {
    region: &'r Region,
    _guard: SharedGuard<'r>,
}

impl<'r> Pin<'r> {
    pub fn region(&self) -> &'r Region {
        self.region
    }

    fn check(&self, off: u64, len: u64) {
        let end = off.checked_add(len).expect("offset overflow");
        assert!(
            end <= self.region.length() + page_size(),
            "region access out of bounds: {:#x}+{:#x} > {:#x}",
            off,
            len,
            self.region.length()
        );
    }

    pub fn read<T: bytemuck::Pod>(&self, off: u64) -> T {
        self.check(off, std::mem::size_of::<T>() as u64);
        unsafe {
            ((self.region.base_addr() + off as usize) as *const T).read_unaligned()
        }
    }

    pub fn write<T: bytemuck::Pod>(&self, off: u64, val: &T) {
        debug_assert_eq!(self.region.perm, Permissions::ReadWrite);
        let size = std::mem::size_of::<T>() as u64;
        self.check(off, size);
        unsafe {
            ((self.region.base_addr() + off as usize) as *mut T).write_unaligned(*val);
        }
        self.region.dirty.read().mark_pages(off, size);
    }

    pub fn bytes(&self, off: u64, len: usize) -> &[u8] {
        self.check(off, len as u64);
        unsafe {
            std::slice::from_raw_parts(
                (self.region.base_addr() + off as usize) as *const u8,
                len,
            )
        }
    }

    pub fn write_bytes(&self, off: u64, data: &[u8]) {
        debug_assert_eq!(self.region.perm, Permissions::ReadWrite);
        self.check(off, data.len() as u64);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.region.base_addr() + off as usize) as *mut u8,
                data.len(),
            );
        }
        self.region.dirty.read().mark_pages(off, data.len() as u64);
    }

    /// An atomic view of an aligned 64-bit word, for root pointers.
    pub fn atomic_u64(&self, off: u64) -> &AtomicU64 {
        self.check(off, 8);
        assert_eq!(off % 8, 0, "atomic access must be aligned");
        unsafe { &*((self.region.base_addr() + off as usize) as *const AtomicU64) }
    }

    /// An atomic view of an aligned 16-bit word, for shared-blob refcounts.
    pub fn atomic_u16(&self, off: u64) -> &std::sync::atomic::AtomicU16 {
        self.check(off, 2);
        assert_eq!(off % 2, 0, "atomic access must be aligned");
        unsafe {
            &*((self.region.base_addr() + off as usize) as *const std::sync::atomic::AtomicU16)
        }
    }

    /// Mark a store done through [`atomic_u64`] as dirtying its page.
    ///
    /// [`atomic_u64`]: Pin::atomic_u64
    pub fn mark_dirty(&self, off: u64, len: u64) {
        self.region.dirty.read().mark_pages(off, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Arc<Region> {
        Region::anonymous(Arc::new(GcLock::new()), 4 * page_size()).unwrap()
    }

    #[test]
    fn read_write_roundtrip() {
        let r = region();
        let pin = r.pin();
        pin.write::<u64>(128, &0xdead_beef_u64);
        assert_eq!(pin.read::<u64>(128), 0xdead_beef);
        pin.write_bytes(4096, b"hello");
        assert_eq!(pin.bytes(4096, 5), b"hello");
    }

    #[test]
    fn length_is_page_aligned() {
        let r = region();
        assert_eq!(r.length() % page_size(), 0);
        assert_eq!(r.length(), 4 * page_size());
    }

    #[test]
    fn writes_mark_dirty_pages() {
        let r = region();
        let pin = r.pin();
        pin.write::<u64>(2 * page_size(), &1u64);
        let table = r.dirty_table();
        assert_eq!(table.next_page(0), Some(2 * page_size()));
    }

    #[test]
    fn grow_in_place_or_restart() {
        let r = region();
        let want = 16 * page_size();
        {
            let _pin = r.pin();
            match r.grow_for(want) {
                Ok(()) => {}
                Err(Fault::Restart(len)) => {
                    drop(_pin);
                    r.resize_moving(len).unwrap();
                }
                Err(Fault::Error(e)) => panic!("{e}"),
            }
        }
        assert!(r.length() >= want);
        let pin = r.pin();
        pin.write::<u64>(want - 8, &7u64);
        assert_eq!(pin.read::<u64>(want - 8), 7);
    }
}
