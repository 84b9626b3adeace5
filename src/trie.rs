//! The mutable copy-on-write trie over a metadata slot.
//!
//! Every mutation builds a fresh path of copy-on-write nodes and publishes
//! it with a single compare-and-swap of the slot's root word, which is the
//! operation's linearisation point. Replaced nodes are reclaimed through
//! the epoch manager once no reader can still see them; provisional nodes
//! of a lost race are deallocated synchronously and the operation restarts
//! against the fresh root.
//!
//! The rooted helpers at the bottom perform one structural edit against an
//! explicit root and return the new root; they are shared by the direct
//! copy-on-write operations here, the transactional trie, and the merge's
//! apply stage.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::arena::Arena;
use crate::epoch::EpochPin;
use crate::error::{Fault, OpResult, Result};
use crate::frag::KeyFragment;
use crate::meta;
use crate::node::{self, Ctx, GcList, State, TriePtr};
use crate::path::{self, TriePath};
use crate::region::{Pin, Region};

/// Result of a single compare-and-swap attempt on one key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CasOutcome {
    Swapped,
    /// The key held this value instead.
    Mismatch(u64),
    Missing,
}

pub struct Trie {
    region: Arc<Region>,
    arena: Arc<Arena>,
    slot: usize,
    data_path: Option<PathBuf>,
    /// In-process half of the per-map commit mutex; the named lock file
    /// covers other processes.
    commit_mutex: Mutex<()>,
}

impl Trie {
    pub(crate) fn new(
        region: Arc<Region>,
        arena: Arc<Arena>,
        slot: usize,
        data_path: Option<PathBuf>,
    ) -> Trie {
        Trie {
            region,
            arena,
            slot,
            data_path,
            commit_mutex: Mutex::new(()),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub(crate) fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub(crate) fn data_path(&self) -> Option<&PathBuf> {
        self.data_path.as_ref()
    }

    pub(crate) fn commit_mutex(&self) -> &Mutex<()> {
        &self.commit_mutex
    }

    pub(crate) fn load_root(&self, pin: &Pin) -> TriePtr {
        TriePtr::from_bits(pin.atomic_u64(meta::root_offset(self.slot)).load(Ordering::SeqCst))
    }

    fn cas_root(&self, pin: &Pin, old: TriePtr, new: TriePtr) -> bool {
        let ok = pin
            .atomic_u64(meta::root_offset(self.slot))
            .compare_exchange(old.bits(), new.bits(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if ok {
            pin.mark_dirty(meta::root_offset(self.slot), 8);
        }
        ok
    }

    /// Publish a new root while holding the commit mutex (transactions).
    pub(crate) fn store_root(&self, pin: &Pin, new: TriePtr) {
        pin.atomic_u64(meta::root_offset(self.slot))
            .store(new.bits(), Ordering::SeqCst);
        pin.mark_dirty(meta::root_offset(self.slot), 8);
    }

    /// Defer node reclamation past every live epoch.
    pub(crate) fn schedule_dealloc(&self, nodes: Vec<TriePtr>, recursive: bool) {
        if nodes.is_empty() {
            return;
        }
        let region = self.region.clone();
        let arena = self.arena.clone();
        self.region.gc().defer(Box::new(move || {
            let pin = region.pin();
            let ctx = Ctx::new(&pin, &arena);
            for ptr in nodes {
                if recursive {
                    node::dealloc_recursive(&ctx, ptr);
                } else {
                    node::dealloc_node(&ctx, ptr);
                }
            }
        }));
    }

    /// An immutable snapshot of the trie. Holds its epoch until dropped.
    pub fn current(&self) -> TrieVersion {
        // Pin the epoch before reading the root so the root can't be
        // retired between the load and the pin.
        let epoch = self.region.gc().pin_epoch();
        let pin = self.region.pin();
        let root = self.load_root(&pin);
        drop(pin);
        TrieVersion {
            root,
            region: self.region.clone(),
            arena: self.arena.clone(),
            _epoch: epoch,
        }
    }

    pub fn size(&self) -> u64 {
        let pin = self.region.pin();
        let ctx = Ctx::new(&pin, &self.arena);
        let root = self.load_root(&pin);
        node::size(&ctx, root)
    }

    /// Structural statistics of the current tree.
    pub fn stats(&self) -> crate::stats::TrieStats {
        let pin = self.region.pin();
        let ctx = Ctx::new(&pin, &self.arena);
        let mut out = crate::stats::TrieStats::default();
        node::stats(&ctx, self.load_root(&pin), &mut out, 1);
        out
    }

    /// Indented textual rendering of the current tree, for debugging.
    pub fn dump(&self) -> String {
        let pin = self.region.pin();
        let ctx = Ctx::new(&pin, &self.arena);
        let mut out = String::new();
        node::dump(&ctx, self.load_root(&pin), 0, &mut out);
        out
    }

    /// Run `op` under a pin, retrying through region moves.
    pub(crate) fn with_retry<T>(&self, mut op: impl FnMut(&Ctx) -> OpResult<T>) -> Result<T> {
        loop {
            let pin = self.region.pin();
            let ctx = Ctx::new(&pin, &self.arena);
            match op(&ctx) {
                Ok(v) => return Ok(v),
                Err(Fault::Restart(len)) => {
                    drop(pin);
                    trace!("trie op restarting for region resize to {len:#x}");
                    self.region.resize_moving(len)?;
                }
                Err(Fault::Error(e)) => return Err(e),
            }
        }
    }

    /// One copy-on-write edit: build the new spine, race the root CAS,
    /// clean up whichever side lost.
    fn publish<T>(
        &self,
        ctx: &Ctx,
        edit: impl Fn(&Ctx, &mut GcList, TriePtr) -> OpResult<Option<(TriePtr, T)>>,
    ) -> OpResult<Option<T>> {
        loop {
            let root = self.load_root(ctx.pin);
            let mut gc = GcList::new();
            match edit(ctx, &mut gc, root) {
                Ok(None) => return Ok(None),
                Ok(Some((new_root, out))) => {
                    // An unchanged root (a fail-fast outcome) publishes
                    // nothing and needs no race.
                    if new_root == root {
                        return Ok(Some(out));
                    }
                    if self.cas_root(ctx.pin, root, new_root) {
                        self.schedule_dealloc(gc.take_old(), false);
                        return Ok(Some(out));
                    }
                    gc.rollback(ctx);
                }
                Err(fault) => {
                    gc.rollback(ctx);
                    return Err(fault);
                }
            }
        }
    }

    /// Insert `(key, value)`. Returns false (and leaves the map unchanged)
    /// when the key is already present.
    pub fn insert(&self, key: &KeyFragment, value: u64) -> Result<bool> {
        self.with_retry(|ctx| {
            self.publish(ctx, |ctx, gc, root| {
                let (new_root, done) =
                    rooted_insert(ctx, gc, root, key, value, State::CopyOnWrite)?;
                if done {
                    Ok(Some((new_root, ())))
                } else {
                    Ok(None)
                }
            })
        })
        .map(|r| r.is_some())
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &KeyFragment) -> Result<Option<u64>> {
        self.with_retry(|ctx| {
            self.publish(ctx, |ctx, gc, root| {
                let (new_root, old) = rooted_remove(ctx, gc, root, key, State::CopyOnWrite)?;
                Ok(old.map(|old| (new_root, old)))
            })
        })
    }

    /// Replace the value at `key`, returning the old value. Absent keys are
    /// left absent.
    pub fn replace(&self, key: &KeyFragment, value: u64) -> Result<Option<u64>> {
        self.with_retry(|ctx| {
            self.publish(ctx, |ctx, gc, root| {
                let (new_root, old) =
                    rooted_replace(ctx, gc, root, key, value, State::CopyOnWrite)?;
                Ok(old.map(|old| (new_root, old)))
            })
        })
    }

    /// Single compare-and-swap attempt at `key`.
    pub fn compare_and_swap(&self, key: &KeyFragment, old: u64, new: u64) -> Result<CasOutcome> {
        self.with_retry(|ctx| {
            let out = self.publish(ctx, |ctx, gc, root| {
                let found = path::find_key(ctx, root, key);
                if !found.valid() {
                    return Ok(Some((root, CasOutcome::Missing)));
                }
                if found.value() != old {
                    return Ok(Some((root, CasOutcome::Mismatch(found.value()))));
                }
                let (new_root, _) = rooted_replace(ctx, gc, root, key, new, State::CopyOnWrite)?;
                Ok(Some((new_root, CasOutcome::Swapped)))
            })?;
            Ok(out.expect("cas publish always resolves"))
        })
    }

    /// Remove `key` only while it still holds `old`.
    pub fn compare_and_remove(&self, key: &KeyFragment, old: u64) -> Result<CasOutcome> {
        self.with_retry(|ctx| {
            let out = self.publish(ctx, |ctx, gc, root| {
                let found = path::find_key(ctx, root, key);
                if !found.valid() {
                    return Ok(Some((root, CasOutcome::Missing)));
                }
                if found.value() != old {
                    return Ok(Some((root, CasOutcome::Mismatch(found.value()))));
                }
                let (new_root, _) = rooted_remove(ctx, gc, root, key, State::CopyOnWrite)?;
                Ok(Some((new_root, CasOutcome::Swapped)))
            })?;
            Ok(out.expect("cas publish always resolves"))
        })
    }

    /// Drop every entry, reclaiming the old tree once readers move on.
    pub fn clear(&self) -> Result<()> {
        self.with_retry(|ctx| loop {
            let root = self.load_root(ctx.pin);
            if root.is_null() {
                return Ok(());
            }
            if self.cas_root(ctx.pin, root, TriePtr::null()) {
                self.schedule_dealloc(vec![root], true);
                return Ok(());
            }
        })
    }
}

/*****************************************************************************/
/* ROOTED EDITS                                                              */
/*****************************************************************************/

/// Bits consumed by the path strictly above entry `index`.
pub(crate) fn prefix_bits(found: &TriePath, index: usize) -> usize {
    let mut bits = 0;
    for i in 0..index {
        bits += found.get_relative(i).bit_num;
    }
    bits
}

/// Replace the child along `found`'s spine with `sub`, copying or mutating
/// ancestors by their state, and return the subtree's new root. Stops early
/// when an in-place ancestor absorbed the change.
pub(crate) fn rebuild_up(
    ctx: &Ctx,
    gc: &mut GcList,
    found: &TriePath,
    last: usize,
    mut sub: TriePtr,
    state: State,
) -> OpResult<TriePtr> {
    for i in (0..last).rev() {
        let old_child = found.get_relative(i).node();
        if sub == old_child {
            return Ok(found.root());
        }
        let parent = found.get_node(i);
        sub = node::replace_child(ctx, gc, parent, old_child, sub, state)?;
    }
    Ok(sub)
}

/// Insert against an explicit root; returns the new root and whether the
/// key was actually inserted.
pub(crate) fn rooted_insert(
    ctx: &Ctx,
    gc: &mut GcList,
    root: TriePtr,
    key: &KeyFragment,
    value: u64,
    state: State,
) -> OpResult<(TriePtr, bool)> {
    let found = path::find_key(ctx, root, key);
    if found.valid() {
        return Ok((root, false));
    }
    let last = found.len() - 1;
    let node_key = key.suffix(prefix_bits(&found, last));
    let target = found.get_node(last);
    let sub = node::insert_leaf(ctx, gc, target, &node_key, value, state)?;
    let new_root = rebuild_up(ctx, gc, &found, last, sub, state)?;
    Ok((new_root, true))
}

/// Remove against an explicit root; returns the new root and the removed
/// value, if any.
pub(crate) fn rooted_remove(
    ctx: &Ctx,
    gc: &mut GcList,
    root: TriePtr,
    key: &KeyFragment,
    state: State,
) -> OpResult<(TriePtr, Option<u64>)> {
    let found = path::find_key(ctx, root, key);
    if !found.valid() {
        return Ok((root, None));
    }
    let value = found.value();
    let last = found.len() - 1;
    let node_key = key.suffix(prefix_bits(&found, last));
    let target = found.get_node(last);
    let sub = node::remove_leaf(ctx, gc, target, &node_key, state)?;
    let new_root = rebuild_up(ctx, gc, &found, last, sub, state)?;
    Ok((new_root, Some(value)))
}

/// Replace against an explicit root; absent keys stay absent.
pub(crate) fn rooted_replace(
    ctx: &Ctx,
    gc: &mut GcList,
    root: TriePtr,
    key: &KeyFragment,
    value: u64,
    state: State,
) -> OpResult<(TriePtr, Option<u64>)> {
    let found = path::find_key(ctx, root, key);
    if !found.valid() {
        return Ok((root, None));
    }
    let old = found.value();
    let last = found.len() - 1;
    let node_key = key.suffix(prefix_bits(&found, last));
    let target = found.get_node(last);
    let sub = node::replace_value(ctx, gc, target, &node_key, value, state)?;
    let new_root = rebuild_up(ctx, gc, &found, last, sub, state)?;
    Ok((new_root, Some(old)))
}

/*****************************************************************************/
/* VERSION                                                                   */
/*****************************************************************************/

/// An immutable snapshot of one trie. All reads through a version observe
/// the same root; the version holds its epoch until dropped so that root
/// stays reachable.
pub struct TrieVersion {
    pub(crate) root: TriePtr,
    region: Arc<Region>,
    arena: Arc<Arena>,
    _epoch: EpochPin,
}

impl TrieVersion {
    pub fn root(&self) -> TriePtr {
        self.root
    }

    pub fn with_ctx<R>(&self, f: impl FnOnce(&Ctx) -> R) -> R {
        let pin = self.region.pin();
        let ctx = Ctx::new(&pin, &self.arena);
        f(&ctx)
    }

    pub fn size(&self) -> u64 {
        self.with_ctx(|ctx| node::size(ctx, self.root))
    }

    pub fn find(&self, key: &KeyFragment) -> Option<u64> {
        self.with_ctx(|ctx| {
            let path = path::find_key(ctx, self.root, key);
            path.valid().then(|| path.value())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::GcLock;
    use crate::region::page_size;

    pub(crate) fn test_trie() -> Trie {
        let region = Region::anonymous(Arc::new(GcLock::new()), 64 * page_size()).unwrap();
        let arena = Arc::new(Arena::new(region.clone()));
        {
            let pin = region.pin();
            arena.format(&pin);
            meta::format(&pin);
            meta::allocate_slot(&pin, 0, "test");
        }
        Trie::new(region, arena, 0, None)
    }

    fn key(k: u64) -> KeyFragment {
        KeyFragment::from_bytes(&k.to_be_bytes())
    }

    #[test]
    fn insert_find_remove() {
        let trie = test_trie();
        for i in 0..500u64 {
            assert!(trie.insert(&key(i), i * 2).unwrap(), "insert {i}");
        }
        assert!(!trie.insert(&key(42), 999).unwrap());
        assert_eq!(trie.size(), 500);

        let version = trie.current();
        for i in 0..500u64 {
            assert_eq!(version.find(&key(i)), Some(i * 2), "find {i}");
        }
        assert_eq!(version.find(&key(1000)), None);
        drop(version);

        for i in 0..500u64 {
            assert_eq!(trie.remove(&key(i)).unwrap(), Some(i * 2), "remove {i}");
        }
        assert_eq!(trie.size(), 0);
        assert_eq!(trie.remove(&key(0)).unwrap(), None);
    }

    #[test]
    fn replace_and_cas() {
        let trie = test_trie();
        trie.insert(&key(1), 10).unwrap();

        assert_eq!(trie.replace(&key(1), 20).unwrap(), Some(10));
        assert_eq!(trie.replace(&key(2), 5).unwrap(), None);
        assert_eq!(trie.current().find(&key(2)), None);

        assert_eq!(
            trie.compare_and_swap(&key(1), 20, 30).unwrap(),
            CasOutcome::Swapped
        );
        assert_eq!(
            trie.compare_and_swap(&key(1), 20, 40).unwrap(),
            CasOutcome::Mismatch(30)
        );
        assert_eq!(
            trie.compare_and_swap(&key(9), 0, 1).unwrap(),
            CasOutcome::Missing
        );

        assert_eq!(
            trie.compare_and_remove(&key(1), 7).unwrap(),
            CasOutcome::Mismatch(30)
        );
        assert_eq!(
            trie.compare_and_remove(&key(1), 30).unwrap(),
            CasOutcome::Swapped
        );
        assert_eq!(trie.size(), 0);
    }

    #[test]
    fn versions_are_stable_snapshots() {
        let trie = test_trie();
        for i in 0..50u64 {
            trie.insert(&key(i), i).unwrap();
        }
        let before = trie.current();
        trie.insert(&key(100), 100).unwrap();
        trie.remove(&key(0)).unwrap();

        assert_eq!(before.size(), 50);
        assert_eq!(before.find(&key(0)), Some(0));
        assert_eq!(before.find(&key(100)), None);

        let after = trie.current();
        assert_eq!(after.size(), 50);
        assert_eq!(after.find(&key(0)), None);
        assert_eq!(after.find(&key(100)), Some(100));
    }

    #[test]
    fn clear_reclaims_everything() {
        let trie = test_trie();
        let baseline = {
            let pin = trie.region.pin();
            trie.arena.bytes_outstanding(&pin)
        };
        for i in 0..200u64 {
            trie.insert(&key(i), i).unwrap();
        }
        trie.clear().unwrap();
        assert_eq!(trie.size(), 0);
        trie.region.gc().defer_barrier();
        let pin = trie.region.pin();
        assert_eq!(trie.arena.bytes_outstanding(&pin), baseline);
    }

    #[test]
    fn removing_everything_releases_node_memory() {
        let trie = test_trie();
        let baseline = {
            let pin = trie.region.pin();
            trie.arena.bytes_outstanding(&pin)
        };
        for i in 0..200u64 {
            trie.insert(&key(i), i).unwrap();
        }
        for i in 0..200u64 {
            trie.remove(&key(i)).unwrap();
        }
        assert_eq!(trie.size(), 0);
        trie.region.gc().defer_barrier();
        let pin = trie.region.pin();
        assert_eq!(trie.arena.bytes_outstanding(&pin), baseline);
    }

    #[test]
    fn concurrent_inserts_are_all_visible() {
        let trie = Arc::new(test_trie());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let trie = trie.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    trie.insert(&key(t * 1000 + i), i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(trie.size(), 400);
        let version = trie.current();
        for t in 0..4u64 {
            for i in 0..100u64 {
                assert_eq!(version.find(&key(t * 1000 + i)), Some(i));
            }
        }
    }
}
