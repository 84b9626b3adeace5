//! Three-way merge of tries: reconcile a transaction's private edits
//! (`src`) with the published tree (`dest`) against their common ancestor
//! (`base`).
//!
//! The merge runs in two stages. The diff stage walks `base` and `src`
//! cursors together, skipping pointer-equal subtrees wholesale and
//! expanding whichever side is coarser until the two frontiers align,
//! emitting one change per key that the transaction touched. The apply
//! stage replays those changes onto `dest`, resolving collisions with the
//! caller's conflict hooks and reporting every value the merge unreferenced
//! so external allocations can be released after the grace period.

use std::collections::VecDeque;

use log::debug;

use crate::error::{DbError, OpResult};
use crate::frag::KeyFragment;
use crate::kv::Kv;
use crate::node::{self, Ctx, GcList, State, TriePtr};
use crate::path;
use crate::trie::{rooted_insert, rooted_remove, rooted_replace};

/// Resolve two values written under one key: `(key, base, src, dest) ->
/// value to keep`. `None` aborts the commit.
pub type InsertConflictFn = dyn Fn(&KeyFragment, Option<u64>, u64, u64) -> Option<u64>;

/// Decide whether a key removed in `src` but modified in `dest` should
/// still be removed: `(key, base, dest) -> remove?`. `None` aborts.
pub type RemoveConflictFn = dyn Fn(&KeyFragment, u64, u64) -> Option<bool>;

/// The default resolutions: source wins an insert race, a remove proceeds.
pub fn default_insert_conflict(
    _key: &KeyFragment,
    _base: Option<u64>,
    src: u64,
    _dest: u64,
) -> Option<u64> {
    Some(src)
}

pub fn default_remove_conflict(_key: &KeyFragment, _base: u64, _dest: u64) -> Option<bool> {
    Some(true)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Key absent in base, present in src.
    Insert { value: u64 },
    /// Key present in both with different values.
    Replace { value: u64, base_value: u64 },
    /// Key present in base, absent in src.
    Remove { base_value: u64 },
}

#[derive(Clone, Debug)]
pub struct Change {
    pub key: KeyFragment,
    pub kind: ChangeKind,
}

impl Change {
    /// The value this change adds to the tree, if any.
    pub fn inserted_value(&self) -> Option<u64> {
        match self.kind {
            ChangeKind::Insert { value } | ChangeKind::Replace { value, .. } => Some(value),
            ChangeKind::Remove { .. } => None,
        }
    }

    /// The base value this change drops from the tree, if any.
    pub fn dropped_value(&self) -> Option<u64> {
        match self.kind {
            ChangeKind::Replace { base_value, .. } | ChangeKind::Remove { base_value } => {
                Some(base_value)
            }
            ChangeKind::Insert { .. } => None,
        }
    }
}

/*****************************************************************************/
/* DIFF                                                                     */
/*****************************************************************************/

/// Every key-level change between `base` and `src`, in key order.
pub fn diff(ctx: &Ctx, base: TriePtr, src: TriePtr) -> Vec<Change> {
    let mut out = Vec::new();
    diff_nodes(ctx, &KeyFragment::empty(), base, src, &mut out);
    out
}

fn diff_nodes(ctx: &Ctx, prefix: &KeyFragment, base: TriePtr, src: TriePtr, out: &mut Vec<Change>) {
    if base == src {
        return;
    }
    let base_kvs = frontier(ctx, base);
    let src_kvs = frontier(ctx, src);
    diff_frontiers(ctx, prefix, base_kvs, src_kvs, out);
}

fn frontier(ctx: &Ctx, ptr: TriePtr) -> VecDeque<Kv> {
    if ptr.is_null() {
        VecDeque::new()
    } else {
        node::gather_kv(ctx, ptr).into()
    }
}

/// Pop the front pointer entry and splice in its children, one level down.
fn expand(ctx: &Ctx, kvs: &mut VecDeque<Kv>) {
    let kv = kvs.pop_front().expect("expand on an empty frontier");
    debug_assert!(kv.is_ptr);
    let children = node::gather_kv(ctx, kv.get_ptr());
    for child in children.into_iter().rev() {
        kvs.push_front(Kv {
            key: kv.key.concat(&child.key),
            value: child.value,
            is_ptr: child.is_ptr,
        });
    }
}

fn emit_all(ctx: &Ctx, prefix: &KeyFragment, kv: &Kv, removed: bool, out: &mut Vec<Change>) {
    let make = |key: KeyFragment, value: u64| Change {
        key,
        kind: if removed {
            ChangeKind::Remove { base_value: value }
        } else {
            ChangeKind::Insert { value }
        },
    };
    if kv.is_ptr {
        node::for_each_value(
            ctx,
            kv.get_ptr(),
            &prefix.concat(&kv.key),
            &mut |key, value| out.push(make(key, value)),
        );
    } else {
        out.push(make(prefix.concat(&kv.key), kv.value));
    }
}

fn diff_frontiers(
    ctx: &Ctx,
    prefix: &KeyFragment,
    mut base: VecDeque<Kv>,
    mut src: VecDeque<Kv>,
    out: &mut Vec<Change>,
) {
    loop {
        let (kb, ks) = match (base.front(), src.front()) {
            (None, None) => return,
            (Some(_), None) => {
                let kv = base.pop_front().unwrap();
                emit_all(ctx, prefix, &kv, true, out);
                continue;
            }
            (None, Some(_)) => {
                let kv = src.pop_front().unwrap();
                emit_all(ctx, prefix, &kv, false, out);
                continue;
            }
            (Some(kb), Some(ks)) => (kb.clone(), ks.clone()),
        };

        if kb.key == ks.key {
            if kb.is_ptr && ks.is_ptr {
                let kb = base.pop_front().unwrap();
                let ks = src.pop_front().unwrap();
                diff_nodes(
                    ctx,
                    &prefix.concat(&kb.key),
                    kb.get_ptr(),
                    ks.get_ptr(),
                    out,
                );
            } else if !kb.is_ptr && !ks.is_ptr {
                let kb = base.pop_front().unwrap();
                let ks = src.pop_front().unwrap();
                if kb.value != ks.value {
                    out.push(Change {
                        key: prefix.concat(&kb.key),
                        kind: ChangeKind::Replace {
                            value: ks.value,
                            base_value: kb.value,
                        },
                    });
                }
            } else if kb.is_ptr {
                expand(ctx, &mut base);
            } else {
                expand(ctx, &mut src);
            }
            continue;
        }

        // Align mismatched granularity: whichever edge is a strict prefix
        // of the other side's front key expands one level.
        let cp = kb.key.common_prefix_len(&ks.key);
        if cp == kb.key.bits() && kb.is_ptr {
            expand(ctx, &mut base);
        } else if cp == ks.key.bits() && ks.is_ptr {
            expand(ctx, &mut src);
        } else if kb.key < ks.key {
            let kv = base.pop_front().unwrap();
            emit_all(ctx, prefix, &kv, true, out);
        } else {
            let kv = src.pop_front().unwrap();
            emit_all(ctx, prefix, &kv, false, out);
        }
    }
}

/*****************************************************************************/
/* APPLY                                                                    */
/*****************************************************************************/

/// Replay `changes` onto `dest`, building in-place nodes registered with
/// `gc`. Returns the merged root and the values this merge unreferenced
/// (overwritten destination values, removed values, and source values a
/// conflict resolution discarded).
pub fn apply(
    ctx: &Ctx,
    gc: &mut GcList,
    dest: TriePtr,
    changes: &[Change],
    on_insert: &InsertConflictFn,
    on_remove: &RemoveConflictFn,
) -> OpResult<(TriePtr, Vec<(KeyFragment, u64)>)> {
    let mut root = dest;
    let mut removed: Vec<(KeyFragment, u64)> = Vec::new();
    let mut conflicts = 0usize;

    for change in changes {
        let key = &change.key;
        let dest_value = {
            let found = path::find_key(ctx, root, key);
            found.valid().then(|| found.value())
        };

        match (&change.kind, dest_value) {
            (ChangeKind::Insert { value } | ChangeKind::Replace { value, .. }, None) => {
                // The destination lost the key since base (it deallocated
                // the old value then); our write lands in the hole.
                let (r, inserted) = rooted_insert(ctx, gc, root, key, *value, State::InPlace)?;
                debug_assert!(inserted);
                root = r;
            }
            (ChangeKind::Insert { value }, Some(dv)) | (ChangeKind::Replace { value, .. }, Some(dv))
                if dv == *value =>
            {
                // Both sides already agree.
            }
            (ChangeKind::Replace { value, base_value }, Some(dv)) if dv == *base_value => {
                // Unmodified in dest: plain replace.
                let (r, _) = rooted_replace(ctx, gc, root, key, *value, State::InPlace)?;
                root = r;
                removed.push((key.clone(), *base_value));
            }
            (ChangeKind::Insert { value }, Some(dv))
            | (ChangeKind::Replace { value, .. }, Some(dv)) => {
                conflicts += 1;
                let base_value = change.dropped_value();
                let resolved = on_insert(key, base_value, *value, dv)
                    .ok_or(DbError::Conflict)?;
                if resolved != dv {
                    let (r, _) = rooted_replace(ctx, gc, root, key, resolved, State::InPlace)?;
                    root = r;
                    removed.push((key.clone(), dv));
                }
                if resolved != *value {
                    removed.push((key.clone(), *value));
                }
            }
            (ChangeKind::Remove { .. }, None) => {
                // Already gone; whoever removed it released the value.
            }
            (ChangeKind::Remove { base_value }, Some(dv)) if dv == *base_value => {
                let (r, old) = rooted_remove(ctx, gc, root, key, State::InPlace)?;
                debug_assert_eq!(old, Some(*base_value));
                root = r;
                removed.push((key.clone(), *base_value));
            }
            (ChangeKind::Remove { base_value }, Some(dv)) => {
                conflicts += 1;
                let remove = on_remove(key, *base_value, dv).ok_or(DbError::Conflict)?;
                if remove {
                    let (r, _) = rooted_remove(ctx, gc, root, key, State::InPlace)?;
                    root = r;
                    removed.push((key.clone(), dv));
                }
            }
        }
    }

    if conflicts > 0 {
        debug!("merge resolved {conflicts} conflicts over {} changes", changes.len());
    }
    Ok((root, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::epoch::GcLock;
    use crate::node::build;
    use crate::region::{page_size, Region};
    use std::sync::Arc;

    fn harness<R>(f: impl FnOnce(&Ctx) -> R) -> R {
        let region = Region::anonymous(Arc::new(GcLock::new()), 64 * page_size()).unwrap();
        let arena = Arena::new(region.clone());
        let pin = region.pin();
        arena.format(&pin);
        let ctx = Ctx::new(&pin, &arena);
        f(&ctx)
    }

    fn tree(ctx: &Ctx, entries: &[(u64, u64)]) -> TriePtr {
        let mut kvs: Vec<Kv> = entries
            .iter()
            .map(|(k, v)| Kv::value(KeyFragment::from_bytes(&k.to_be_bytes()), *v))
            .collect();
        kvs.sort_by(|a, b| a.key.cmp(&b.key));
        let mut gc = GcList::new();
        build(ctx, &mut gc, &kvs, State::CopyOnWrite).unwrap()
    }

    fn key(k: u64) -> KeyFragment {
        KeyFragment::from_bytes(&k.to_be_bytes())
    }

    #[test]
    fn diff_sees_inserts_removes_replaces() {
        harness(|ctx| {
            let base = tree(ctx, &[(1, 10), (2, 20), (3, 30)]);
            let src = tree(ctx, &[(1, 10), (2, 21), (4, 40)]);
            let changes = diff(ctx, base, src);
            assert_eq!(changes.len(), 3);
            assert_eq!(
                changes[0].kind,
                ChangeKind::Replace {
                    value: 21,
                    base_value: 20
                }
            );
            assert_eq!(changes[0].key, key(2));
            assert_eq!(changes[1].kind, ChangeKind::Remove { base_value: 30 });
            assert_eq!(changes[2].kind, ChangeKind::Insert { value: 40 });
        });
    }

    #[test]
    fn diff_skips_shared_subtrees() {
        harness(|ctx| {
            let base = tree(ctx, &(0..100).map(|i| (i, i)).collect::<Vec<_>>());
            let changes = diff(ctx, base, base);
            assert!(changes.is_empty());
        });
    }

    #[test]
    fn apply_disjoint_edits_union() {
        harness(|ctx| {
            let base = tree(ctx, &[(1, 1)]);
            let src = tree(ctx, &[(1, 1), (2, 2)]);
            let dest = tree(ctx, &[(1, 1), (3, 3)]);
            let changes = diff(ctx, base, src);
            let mut gc = GcList::new();
            let (merged, removed) = apply(
                ctx,
                &mut gc,
                dest,
                &changes,
                &default_insert_conflict,
                &default_remove_conflict,
            )
            .unwrap();
            assert!(removed.is_empty());
            for (k, v) in [(1u64, 1u64), (2, 2), (3, 3)] {
                let found = path::find_key(ctx, merged, &key(k));
                assert!(found.valid());
                assert_eq!(found.value(), v);
            }
        });
    }

    #[test]
    fn apply_conflicting_replace_takes_src_by_default() {
        harness(|ctx| {
            let base = tree(ctx, &[(7, 1)]);
            let src = tree(ctx, &[(7, 2)]);
            let dest = tree(ctx, &[(7, 3)]);
            let changes = diff(ctx, base, src);
            let mut gc = GcList::new();
            let (merged, removed) = apply(
                ctx,
                &mut gc,
                dest,
                &changes,
                &default_insert_conflict,
                &default_remove_conflict,
            )
            .unwrap();
            let found = path::find_key(ctx, merged, &key(7));
            assert_eq!(found.value(), 2);
            assert_eq!(removed, vec![(key(7), 3)]);
        });
    }

    #[test]
    fn apply_unresolved_conflict_errors() {
        harness(|ctx| {
            let base = tree(ctx, &[(7, 1)]);
            let src = tree(ctx, &[(7, 2)]);
            let dest = tree(ctx, &[(7, 3)]);
            let changes = diff(ctx, base, src);
            let mut gc = GcList::new();
            let err = apply(ctx, &mut gc, dest, &changes, &|_, _, _, _| None, &|_, _, _| {
                Some(true)
            });
            assert!(err.is_err());
        });
    }
}
