//! The transactional trie: a per-thread private fork of a mutable trie.
//!
//! All nodes created inside a transaction carry the in-place state, so
//! edits mutate the workspace directly instead of copying. Because every
//! ancestor of an in-place node is itself in-place, none of it is visible
//! through the published root until `commit` merges the fork back under
//! the named per-map commit mutex.

use std::collections::HashSet;

use log::{debug, trace};

use crate::epoch::EpochPin;
use crate::error::{Fault, Result};
use crate::frag::KeyFragment;
use crate::lockfile::{self, NamedLock};
use crate::merge::{self, Change, InsertConflictFn, RemoveConflictFn};
use crate::node::{self, Ctx, GcList, State, TriePtr};
use crate::path;
use crate::trie::{rooted_insert, rooted_remove, rooted_replace, Trie};

/// A private, isolated workspace over one trie.
///
/// Reads see the state at fork time plus the transaction's own writes;
/// the parent map never sees the workspace until commit.
pub struct TrieTransaction<'t> {
    trie: &'t Trie,
    original_root: TriePtr,
    root: TriePtr,
    gc: GcList,
    finished: bool,
    _epoch: EpochPin,
}

impl<'t> TrieTransaction<'t> {
    pub(crate) fn fork(trie: &'t Trie) -> TrieTransaction<'t> {
        let epoch = trie.region().gc().pin_epoch();
        let pin = trie.region().pin();
        let original_root = trie.load_root(&pin);
        drop(pin);
        TrieTransaction {
            trie,
            original_root,
            root: original_root,
            gc: GcList::new(),
            finished: false,
            _epoch: epoch,
        }
    }

    pub fn original_root(&self) -> TriePtr {
        self.original_root
    }

    /// True once the transaction has committed or rolled back.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn size(&self) -> u64 {
        let pin = self.trie.region().pin();
        let ctx = Ctx::new(&pin, self.trie.arena());
        node::size(&ctx, self.root)
    }

    pub fn find(&self, key: &KeyFragment) -> Option<u64> {
        let pin = self.trie.region().pin();
        let ctx = Ctx::new(&pin, self.trie.arena());
        let found = path::find_key(&ctx, self.root, key);
        found.valid().then(|| found.value())
    }

    fn mutate<T>(
        &mut self,
        op: impl Fn(&Ctx, &mut GcList, TriePtr) -> crate::error::OpResult<(TriePtr, T)>,
    ) -> Result<T> {
        assert!(!self.finished, "operation on a finished transaction");
        loop {
            let pin = self.trie.region().pin();
            let ctx = Ctx::new(&pin, self.trie.arena());
            match op(&ctx, &mut self.gc, self.root) {
                Ok((new_root, out)) => {
                    self.root = new_root;
                    return Ok(out);
                }
                Err(Fault::Restart(len)) => {
                    drop(pin);
                    self.trie.region().resize_moving(len)?;
                }
                Err(Fault::Error(e)) => return Err(e),
            }
        }
    }

    /// Insert `(key, value)`; false when the key already exists.
    pub fn insert(&mut self, key: &KeyFragment, value: u64) -> Result<bool> {
        self.mutate(|ctx, gc, root| rooted_insert(ctx, gc, root, key, value, State::InPlace))
    }

    /// Replace the value at `key`, returning the old one. Absent keys stay
    /// absent.
    pub fn replace(&mut self, key: &KeyFragment, value: u64) -> Result<Option<u64>> {
        self.mutate(|ctx, gc, root| rooted_replace(ctx, gc, root, key, value, State::InPlace))
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &KeyFragment) -> Result<Option<u64>> {
        self.mutate(|ctx, gc, root| rooted_remove(ctx, gc, root, key, State::InPlace))
    }

    /// Dropping every key of the base through a transaction is not
    /// supported; clear the map directly instead.
    pub fn clear(&mut self) -> ! {
        panic!("clear() inside a transaction is not supported");
    }

    /// Every key-level change this transaction made so far.
    pub fn changes(&self) -> Vec<Change> {
        let pin = self.trie.region().pin();
        let ctx = Ctx::new(&pin, self.trie.arena());
        merge::diff(&ctx, self.original_root, self.root)
    }

    /// Merge the workspace into the published tree under the per-map commit
    /// mutex. Returns the values the commit unreferenced, for the caller's
    /// deallocator (after the grace period).
    pub fn commit(
        &mut self,
        on_insert: &InsertConflictFn,
        on_remove: &RemoveConflictFn,
    ) -> Result<Vec<(KeyFragment, u64)>> {
        assert!(!self.finished, "commit on a finished transaction");
        let _local = self.trie.commit_mutex().lock();
        let named = self.named_lock()?;
        if let Some(lock) = named.as_ref() {
            lock.lock()?;
        }
        let result = self.commit_locked(on_insert, on_remove);
        if let Some(lock) = named.as_ref() {
            lock.unlock();
        }
        result
    }

    /// Non-blocking commit; `None` when another committer holds the mutex.
    pub fn try_commit(
        &mut self,
        on_insert: &InsertConflictFn,
        on_remove: &RemoveConflictFn,
    ) -> Result<Option<Vec<(KeyFragment, u64)>>> {
        assert!(!self.finished, "commit on a finished transaction");
        let Some(_local) = self.trie.commit_mutex().try_lock() else {
            return Ok(None);
        };
        let named = self.named_lock()?;
        if let Some(lock) = named.as_ref() {
            if !lock.try_lock()? {
                return Ok(None);
            }
        }
        let result = self.commit_locked(on_insert, on_remove);
        if let Some(lock) = named.as_ref() {
            lock.unlock();
        }
        result.map(Some)
    }

    fn named_lock(&self) -> Result<Option<NamedLock>> {
        match self.trie.data_path() {
            Some(path) => Ok(Some(NamedLock::open(lockfile::commit_lock_path(
                path,
                self.trie.slot(),
            ))?)),
            None => Ok(None),
        }
    }

    fn commit_locked(
        &mut self,
        on_insert: &InsertConflictFn,
        on_remove: &RemoveConflictFn,
    ) -> Result<Vec<(KeyFragment, u64)>> {
        loop {
            let pin = self.trie.region().pin();
            let ctx = Ctx::new(&pin, self.trie.arena());
            let dest = self.trie.load_root(&pin);

            if self.root == self.original_root {
                // Read-only transaction.
                self.finished = true;
                return Ok(Vec::new());
            }

            let changes = merge::diff(&ctx, self.original_root, self.root);

            if dest == self.original_root {
                // Nobody moved the map since the fork: adopt the workspace
                // wholesale. The nodes it shadowed become garbage once the
                // store is visible and the readers' epochs pass.
                let removed = changes
                    .iter()
                    .filter_map(|c| c.dropped_value().map(|v| (c.key.clone(), v)))
                    .collect();
                let new_root = self.adopt_workspace(&ctx, self.root);
                self.trie.store_root(&pin, new_root);
                self.trie.schedule_dealloc(self.gc.take_old(), false);
                self.finished = true;
                self.root = new_root;
                debug!("fast-path commit of {} changes", changes.len());
                return Ok(removed);
            }

            // The published tree moved: replay our changes against it.
            let mut apply_gc = GcList::new();
            match merge::apply(&ctx, &mut apply_gc, dest, &changes, on_insert, on_remove) {
                Ok((merged, removed)) => {
                    let new_root = self.adopt_merge(&ctx, merged, &mut apply_gc);
                    self.trie.store_root(&pin, new_root);
                    self.trie.schedule_dealloc(apply_gc.take_old(), false);
                    // The workspace tree itself never got published; the
                    // nodes it shadowed still belong to base/dest and the
                    // whole private spine dies now.
                    self.gc.take_old();
                    for ptr in self.gc.take_new() {
                        node::dealloc_node(&ctx, ptr);
                    }
                    self.finished = true;
                    self.root = new_root;
                    debug!(
                        "three-way commit of {} changes ({} values released)",
                        changes.len(),
                        removed.len()
                    );
                    return Ok(removed);
                }
                Err(Fault::Restart(len)) => {
                    apply_gc.rollback(&ctx);
                    drop(pin);
                    self.trie.region().resize_moving(len)?;
                }
                Err(Fault::Error(e)) => {
                    apply_gc.rollback(&ctx);
                    return Err(e);
                }
            }
        }
    }

    /// Flip the workspace back to copy-on-write, freeing in-place nodes
    /// that did not survive into the published tree.
    fn adopt_workspace(&mut self, ctx: &Ctx, root: TriePtr) -> TriePtr {
        let mut survivors: HashSet<u64> = HashSet::new();
        let new_root = node::convert_to_cow(ctx, root, &mut |ip| {
            survivors.insert(ip.bits());
        }, &mut |_| {});
        for ptr in self.gc.take_new() {
            if !survivors.contains(&ptr.bits()) {
                node::dealloc_node(ctx, ptr);
            }
        }
        new_root
    }

    /// Same conversion for the merge-built tree, pruning its own ledger.
    fn adopt_merge(&mut self, ctx: &Ctx, root: TriePtr, apply_gc: &mut GcList) -> TriePtr {
        let mut survivors: HashSet<u64> = HashSet::new();
        let new_root = node::convert_to_cow(ctx, root, &mut |ip| {
            survivors.insert(ip.bits());
        }, &mut |_| {});
        for ptr in apply_gc.take_new() {
            if !survivors.contains(&ptr.bits()) {
                node::dealloc_node(ctx, ptr);
            }
        }
        new_root
    }

    /// Abandon the workspace. Returns the values the transaction inserted,
    /// so the caller can release their external allocations.
    pub fn rollback(&mut self) -> Vec<(KeyFragment, u64)> {
        if self.finished {
            return Vec::new();
        }
        let pin = self.trie.region().pin();
        let ctx = Ctx::new(&pin, self.trie.arena());
        let inserted = merge::diff(&ctx, self.original_root, self.root)
            .iter()
            .filter_map(|c| c.inserted_value().map(|v| (c.key.clone(), v)))
            .collect();
        self.gc.take_old();
        for ptr in self.gc.take_new() {
            node::dealloc_node(&ctx, ptr);
        }
        self.root = self.original_root;
        self.finished = true;
        trace!("transaction rolled back");
        inserted
    }
}

impl Drop for TrieTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

impl Trie {
    /// Fork a private transactional workspace from the current state.
    pub fn transaction(&self) -> TrieTransaction<'_> {
        TrieTransaction::fork(self)
    }
}

/// Commit with the default conflict resolutions.
pub fn commit_default(txn: &mut TrieTransaction<'_>) -> Result<Vec<(KeyFragment, u64)>> {
    txn.commit(
        &merge::default_insert_conflict,
        &merge::default_remove_conflict,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::CasOutcome;

    fn key(k: u64) -> KeyFragment {
        KeyFragment::from_bytes(&k.to_be_bytes())
    }

    fn test_trie() -> Trie {
        use crate::arena::Arena;
        use crate::epoch::GcLock;
        use crate::meta;
        use crate::region::{page_size, Region};
        use std::sync::Arc;

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

    #[test]
    fn transaction_isolation() {
        let trie = test_trie();
        trie.insert(&key(1), 1).unwrap();

        let mut txn = trie.transaction();
        txn.insert(&key(2), 2).unwrap();
        txn.replace(&key(1), 11).unwrap();

        // The parent doesn't see the workspace.
        assert_eq!(trie.current().find(&key(2)), None);
        assert_eq!(trie.current().find(&key(1)), Some(1));
        // The workspace sees its own writes.
        assert_eq!(txn.find(&key(2)), Some(2));
        assert_eq!(txn.find(&key(1)), Some(11));

        // Writes made to the parent after the fork stay invisible.
        trie.insert(&key(3), 3).unwrap();
        assert_eq!(txn.find(&key(3)), None);

        commit_default(&mut txn).unwrap();
        assert_eq!(trie.current().find(&key(1)), Some(11));
        assert_eq!(trie.current().find(&key(2)), Some(2));
        assert_eq!(trie.current().find(&key(3)), Some(3));
    }

    #[test]
    fn fast_path_commit_publishes_workspace() {
        let trie = test_trie();
        for i in 0..50u64 {
            trie.insert(&key(i), i).unwrap();
        }
        let mut txn = trie.transaction();
        for i in 50..100u64 {
            txn.insert(&key(i), i).unwrap();
        }
        for i in 0..10u64 {
            txn.remove(&key(i)).unwrap();
        }
        let removed = commit_default(&mut txn).unwrap();
        assert_eq!(removed.len(), 10);

        assert_eq!(trie.size(), 90);
        let version = trie.current();
        for i in 10..100u64 {
            assert_eq!(version.find(&key(i)), Some(i));
        }
        for i in 0..10u64 {
            assert_eq!(version.find(&key(i)), None);
        }
    }

    #[test]
    fn disjoint_transactions_union_either_order() {
        for flip in [false, true] {
            let trie = test_trie();
            trie.insert(&key(1000), 0).unwrap();

            let mut a = trie.transaction();
            let mut b = trie.transaction();
            for i in 0..13u64 {
                a.insert(&key(i), i).unwrap();
            }
            for i in 13..26u64 {
                b.insert(&key(i), i).unwrap();
            }
            if flip {
                commit_default(&mut b).unwrap();
                commit_default(&mut a).unwrap();
            } else {
                commit_default(&mut a).unwrap();
                commit_default(&mut b).unwrap();
            }

            assert_eq!(trie.size(), 27);
            let version = trie.current();
            for i in 0..26u64 {
                assert_eq!(version.find(&key(i)), Some(i), "flip={flip} key={i}");
            }
        }
    }

    #[test]
    fn overlapping_replace_commit_order() {
        // Base {k:1}; TX1 replaces with 2, TX2 with 3. The source value of
        // the later committer wins under the default resolution.
        for (first, second, expect) in [(2u64, 3u64, 3u64), (3, 2, 2)] {
            let trie = test_trie();
            trie.insert(&key(7), 1).unwrap();

            let mut tx1 = trie.transaction();
            let mut tx2 = trie.transaction();
            tx1.replace(&key(7), first).unwrap();
            tx2.replace(&key(7), second).unwrap();

            commit_default(&mut tx1).unwrap();
            let removed = commit_default(&mut tx2).unwrap();

            assert_eq!(trie.current().find(&key(7)), Some(expect));
            // The loser's value was reported for deallocation.
            assert_eq!(removed, vec![(key(7), first)]);
        }
    }

    #[test]
    fn rollback_releases_workspace() {
        let trie = test_trie();
        trie.insert(&key(1), 1).unwrap();
        let baseline = {
            let pin = trie.region().pin();
            trie.arena().bytes_outstanding(&pin)
        };

        let mut txn = trie.transaction();
        for i in 10..60u64 {
            txn.insert(&key(i), i).unwrap();
        }
        let inserted = txn.rollback();
        assert_eq!(inserted.len(), 50);

        assert_eq!(trie.size(), 1);
        assert_eq!(trie.current().find(&key(1)), Some(1));
        let pin = trie.region().pin();
        assert_eq!(trie.arena().bytes_outstanding(&pin), baseline);
    }

    #[test]
    fn try_commit_reports_busy() {
        let trie = test_trie();
        let mut txn = trie.transaction();
        txn.insert(&key(1), 1).unwrap();

        let _held = trie.commit_mutex().lock();
        assert!(txn
            .try_commit(
                &merge::default_insert_conflict,
                &merge::default_remove_conflict
            )
            .unwrap()
            .is_none());
        drop(_held);
        assert!(txn
            .try_commit(
                &merge::default_insert_conflict,
                &merge::default_remove_conflict
            )
            .unwrap()
            .is_some());
    }

    #[test]
    fn commit_races_with_direct_cas() {
        let trie = test_trie();
        trie.insert(&key(1), 1).unwrap();

        let mut txn = trie.transaction();
        txn.insert(&key(2), 2).unwrap();

        // Direct mutation between fork and commit forces the merge path.
        assert_eq!(
            trie.compare_and_swap(&key(1), 1, 100).unwrap(),
            CasOutcome::Swapped
        );

        commit_default(&mut txn).unwrap();
        let version = trie.current();
        assert_eq!(version.find(&key(1)), Some(100));
        assert_eq!(version.find(&key(2)), Some(2));
    }
}
