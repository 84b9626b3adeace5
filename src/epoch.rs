//! Process-wide RCU-style reclamation and region locking.
//!
//! Readers pin an epoch for as long as they may follow pointers into
//! structures that a writer could retire. Deferred work (node reclamation)
//! runs only once every epoch pinned at enqueue time has been released.
//!
//! The same object also carries the region's reader/writer discipline:
//! shared holders keep the mapping from moving, the exclusive holder may
//! move it. This is an explicit dependency handed to the region and the
//! tries, never a hidden singleton.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

const UNPINNED: u64 = u64::MAX;

struct Slot {
    epoch: AtomicU64,
}

type Deferred = (u64, Box<dyn FnOnce() + Send>);

pub struct GcLock {
    epoch: AtomicU64,
    readers: AtomicUsize,
    excl_waiting: AtomicBool,
    excl: Mutex<()>,
    slots: Mutex<Vec<Arc<Slot>>>,
    free_slots: Mutex<Vec<Arc<Slot>>>,
    deferred: Mutex<VecDeque<Deferred>>,
}

impl Default for GcLock {
    fn default() -> Self {
        GcLock::new()
    }
}

impl GcLock {
    pub fn new() -> GcLock {
        GcLock {
            epoch: AtomicU64::new(1),
            readers: AtomicUsize::new(0),
            excl_waiting: AtomicBool::new(false),
            excl: Mutex::new(()),
            slots: Mutex::new(Vec::new()),
            free_slots: Mutex::new(Vec::new()),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    fn acquire_slot(&self) -> Arc<Slot> {
        if let Some(slot) = self.free_slots.lock().pop() {
            return slot;
        }
        let slot = Arc::new(Slot {
            epoch: AtomicU64::new(UNPINNED),
        });
        self.slots.lock().push(slot.clone());
        slot
    }

    fn pin_slot(&self, slot: &Slot) {
        loop {
            let e = self.epoch.load(Ordering::SeqCst);
            slot.epoch.store(e, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == e {
                return;
            }
        }
    }

    fn release_slot(&self, slot: Arc<Slot>) {
        slot.epoch.store(UNPINNED, Ordering::SeqCst);
        self.free_slots.lock().push(slot);
    }

    fn min_pinned(&self) -> u64 {
        let slots = self.slots.lock();
        slots
            .iter()
            .map(|s| s.epoch.load(Ordering::SeqCst))
            .min()
            .unwrap_or(UNPINNED)
    }

    /// Pin an epoch without blocking resizes. Protects retired structures
    /// from reclamation but retains no right to follow region pointers.
    pub fn pin_epoch(self: &Arc<Self>) -> EpochPin {
        let slot = self.acquire_slot();
        self.pin_slot(&slot);
        EpochPin {
            gc: self.clone(),
            slot: Some(slot),
        }
    }

    /// Shared region lock: keeps the mapping in place and pins an epoch.
    pub fn lock_shared(&self) -> SharedGuard<'_> {
        loop {
            while self.excl_waiting.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            self.readers.fetch_add(1, Ordering::SeqCst);
            if !self.excl_waiting.load(Ordering::SeqCst) {
                break;
            }
            // A writer slipped in; back off so it can make progress.
            self.readers.fetch_sub(1, Ordering::SeqCst);
        }
        let slot = self.acquire_slot();
        self.pin_slot(&slot);
        SharedGuard {
            gc: self,
            slot: Some(slot),
        }
    }

    /// Exclusive region lock: serialises with all shared and exclusive
    /// holders. Used only by moving resizes and the snapshot driver.
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        let guard = self.excl.lock();
        self.excl_waiting.store(true, Ordering::SeqCst);
        while self.readers.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
        ExclusiveGuard {
            gc: self,
            _guard: guard,
        }
    }

    /// Enqueue work to run once every epoch pinned right now has passed.
    pub fn defer(&self, work: Box<dyn FnOnce() + Send>) {
        let stamp = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.deferred.lock().push_back((stamp, work));
    }

    /// Run every deferred item that no pinned epoch can still observe.
    pub fn collect(&self) {
        let mut runnable = Vec::new();
        {
            let mut queue = self.deferred.lock();
            if queue.is_empty() {
                return;
            }
            let min = self.min_pinned();
            while let Some((stamp, _)) = queue.front() {
                if *stamp >= min {
                    break;
                }
                runnable.push(queue.pop_front().unwrap().1);
            }
        }
        for work in runnable {
            work();
        }
    }

    /// Block until all work deferred before this call has run.
    ///
    /// The caller must not hold a pin or an epoch, or the barrier can
    /// never clear.
    pub fn defer_barrier(&self) {
        let barrier = self.epoch.fetch_add(1, Ordering::SeqCst);
        loop {
            self.collect();
            let pending = {
                let queue = self.deferred.lock();
                queue.front().map(|(stamp, _)| *stamp <= barrier).unwrap_or(false)
            };
            if !pending {
                return;
            }
            std::thread::yield_now();
        }
    }

    #[cfg(test)]
    fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }
}

/// An epoch pin with no claim on the mapping itself.
pub struct EpochPin {
    gc: Arc<GcLock>,
    slot: Option<Arc<Slot>>,
}

impl Drop for EpochPin {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.gc.release_slot(slot);
        }
        self.gc.collect();
    }
}

/// Shared hold on the region: the mapping will not move while this lives.
pub struct SharedGuard<'a> {
    gc: &'a GcLock,
    slot: Option<Arc<Slot>>,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.gc.release_slot(slot);
        }
        self.gc.readers.fetch_sub(1, Ordering::SeqCst);
        self.gc.collect();
    }
}

pub struct ExclusiveGuard<'a> {
    gc: &'a GcLock,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.gc.excl_waiting.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn defer_waits_for_pins() {
        let gc = Arc::new(GcLock::new());
        let ran = Arc::new(AtomicU32::new(0));

        let pin = gc.pin_epoch();
        let r = ran.clone();
        gc.defer(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        gc.collect();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(gc.deferred_len(), 1);

        drop(pin);
        gc.collect();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn barrier_drains() {
        let gc = Arc::new(GcLock::new());
        let ran = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let r = ran.clone();
            gc.defer(Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }));
        }
        gc.defer_barrier();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(gc.deferred_len(), 0);
    }

    #[test]
    fn shared_and_exclusive_serialise() {
        let gc = Arc::new(GcLock::new());
        let running = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gc = gc.clone();
            let running = running.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let _g = gc.lock_shared();
                    running.fetch_add(1, Ordering::SeqCst);
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for _ in 0..20 {
            let _x = gc.lock_exclusive();
            assert_eq!(running.load(Ordering::SeqCst), 0);
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
