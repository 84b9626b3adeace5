//! Paths from a trie root to a value.
//!
//! A path entry records how far one node took us: how many bits were
//! matched, at which in-order rank, and whether we landed on a value, a
//! child to follow, or off the end (a position for insertion). Paths store
//! cumulative ranks and bit counts; node primitives produce relative
//! entries which [`TriePath::push`] accumulates.

use crate::frag::KeyFragment;
use crate::node::{self, Ctx, TriePtr};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryKind {
    Terminal,
    NonTerminal,
    OffTheEnd,
}

#[derive(Clone, Copy, Debug)]
pub struct TriePathEntry {
    /// Value bits for a terminal entry, child pointer bits otherwise.
    pub data: u64,
    /// In-order rank; relative when produced by a node, cumulative once
    /// pushed onto a path.
    pub entry_num: u64,
    /// Bits matched; same relativity as `entry_num`.
    pub bit_num: usize,
    pub kind: EntryKind,
}

impl TriePathEntry {
    pub fn terminal(bits: usize, value: u64, skipped: u64) -> TriePathEntry {
        TriePathEntry {
            data: value,
            entry_num: skipped,
            bit_num: bits,
            kind: EntryKind::Terminal,
        }
    }

    pub fn non_terminal(bits: usize, child: TriePtr, skipped: u64) -> TriePathEntry {
        TriePathEntry {
            data: child.bits(),
            entry_num: skipped,
            bit_num: bits,
            kind: EntryKind::NonTerminal,
        }
    }

    pub fn off_the_end(skipped: u64) -> TriePathEntry {
        TriePathEntry {
            data: 0,
            entry_num: skipped,
            bit_num: 0,
            kind: EntryKind::OffTheEnd,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == EntryKind::Terminal
    }

    pub fn is_non_terminal(&self) -> bool {
        self.kind == EntryKind::NonTerminal
    }

    pub fn is_off_the_end(&self) -> bool {
        self.kind == EntryKind::OffTheEnd
    }

    /// The node reached after this entry.
    pub fn node(&self) -> TriePtr {
        debug_assert!(self.is_non_terminal());
        TriePtr::from_bits(self.data)
    }

    pub fn value(&self) -> u64 {
        debug_assert!(self.is_terminal());
        self.data
    }
}

#[derive(Clone, Debug, Default)]
pub struct TriePath {
    root: TriePtr,
    entries: Vec<TriePathEntry>,
}

impl TriePath {
    pub fn new(root: TriePtr) -> TriePath {
        TriePath {
            root,
            entries: Vec::new(),
        }
    }

    pub fn root(&self) -> TriePtr {
        self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a relative entry, accumulating rank and bit counts.
    pub fn push(&mut self, mut entry: TriePathEntry) {
        if let Some(last) = self.entries.last() {
            entry.entry_num += last.entry_num;
            entry.bit_num += last.bit_num;
        }
        self.entries.push(entry);
    }

    pub fn last(&self) -> Option<&TriePathEntry> {
        self.entries.last()
    }

    /// The last node reached: the target of a trailing non-terminal entry,
    /// or the node holding the final value otherwise.
    pub fn last_node(&self) -> TriePtr {
        let mut i = self.entries.len();
        if i == 0 {
            return self.root;
        }
        if !self.entries[i - 1].is_non_terminal() {
            i -= 1;
        }
        if i == 0 {
            return self.root;
        }
        debug_assert!(self.entries[i - 1].is_non_terminal());
        self.entries[i - 1].node()
    }

    /// The node entered at path index `i` (0 is the root).
    pub fn get_node(&self, i: usize) -> TriePtr {
        if i == 0 {
            self.root
        } else {
            self.entries[i - 1].node()
        }
    }

    /// Entry `i` with rank and bits relative to its own node.
    pub fn get_relative(&self, i: usize) -> TriePathEntry {
        let mut entry = self.entries[i];
        if i > 0 {
            let prev = self.entries[i - 1];
            entry.entry_num -= prev.entry_num;
            entry.bit_num -= prev.bit_num;
        }
        entry
    }

    /// A path is valid when it ends at a value.
    pub fn valid(&self) -> bool {
        self.entries.last().map(|e| e.is_terminal()).unwrap_or(false)
    }

    pub fn value(&self) -> u64 {
        self.entries
            .last()
            .expect("value of an empty path")
            .value()
    }

    /// Cumulative in-order rank of the path's position.
    pub fn entry_num(&self) -> u64 {
        self.entries.last().map(|e| e.entry_num).unwrap_or(0)
    }

    pub fn total_bits(&self) -> usize {
        self.entries.last().map(|e| e.bit_num).unwrap_or(0)
    }

    /// Reconstruct the full key this path matched.
    pub fn key(&self, ctx: &Ctx) -> KeyFragment {
        let mut key = KeyFragment::empty();
        for i in 0..self.entries.len() {
            let rel = self.get_relative(i);
            if rel.is_off_the_end() {
                break;
            }
            key = key.concat(&node::extract_key(ctx, self.get_node(i), rel.entry_num));
        }
        key
    }
}

/*****************************************************************************/
/* DRIVERS                                                                   */
/*****************************************************************************/

/// Walk `match_key` from the root until terminal or off the end.
pub fn find_key(ctx: &Ctx, root: TriePtr, key: &KeyFragment) -> TriePath {
    let mut path = TriePath::new(root);
    let mut node = root;
    let mut key = key.clone();

    loop {
        let entry = node::match_key(ctx, node, &key);
        let bits = entry.bit_num;
        let next = if entry.is_non_terminal() {
            Some(entry.node())
        } else {
            None
        };
        path.push(entry);
        match next {
            Some(child) => {
                debug_assert!(bits > 0);
                key.drop_bits(bits);
                node = child;
            }
            None => return path,
        }
    }
}

/// Walk `match_index` from the root, decrementing the residual rank as
/// non-terminal entries are descended.
pub fn find_index(ctx: &Ctx, root: TriePtr, index: u64) -> TriePath {
    if index >= node::size(ctx, root) {
        return end(ctx, root);
    }
    let mut path = TriePath::new(root);
    let mut node = root;
    let mut index = index;

    loop {
        let entry = node::match_index(ctx, node, index);
        let start = entry.entry_num;
        let next = if entry.is_non_terminal() {
            Some(entry.node())
        } else {
            None
        };
        path.push(entry);
        match next {
            Some(child) => {
                index -= start;
                node = child;
            }
            None => return path,
        }
    }
}

/// Path to the first value.
pub fn begin(ctx: &Ctx, root: TriePtr) -> TriePath {
    let mut path = TriePath::new(root);
    let mut node = root;
    loop {
        let entry = node::first(ctx, node);
        let next = if entry.is_non_terminal() {
            Some(entry.node())
        } else {
            None
        };
        path.push(entry);
        match next {
            Some(child) => node = child,
            None => return path,
        }
    }
}

/// One-past-the-end path.
pub fn end(ctx: &Ctx, root: TriePtr) -> TriePath {
    let mut path = TriePath::new(root);
    path.push(node::off_the_end(ctx, root));
    path
}

/// Re-position the path by `n` ranks (negative walks backwards). The result
/// clamps to the off-the-end position.
pub fn advance(ctx: &Ctx, path: &TriePath, n: i64) -> TriePath {
    let rank = path.entry_num() as i64 + n;
    assert!(rank >= 0, "advance before the beginning");
    find_index(ctx, path.root(), rank as u64)
}

enum Bound {
    Found(Vec<TriePathEntry>),
    NotFound(u64),
}

/// Smallest entry >= `key` (`strict`: > `key`), or the end path.
pub fn find_bound(ctx: &Ctx, root: TriePtr, key: &KeyFragment, strict: bool) -> TriePath {
    match bound_rec(ctx, root, key.clone(), strict) {
        Bound::Found(entries) => {
            let mut path = TriePath::new(root);
            for entry in entries {
                path.push(entry);
            }
            path
        }
        Bound::NotFound(_) => end(ctx, root),
    }
}

fn bound_rec(ctx: &Ctx, node: TriePtr, key: KeyFragment, strict: bool) -> Bound {
    let mut rank = 0u64;
    for kv in node::gather_kv(ctx, node) {
        if !kv.is_ptr {
            match kv.key.cmp(&key) {
                std::cmp::Ordering::Less => rank += 1,
                std::cmp::Ordering::Equal if strict => rank += 1,
                _ => {
                    return Bound::Found(vec![TriePathEntry::terminal(
                        kv.key.bits(),
                        kv.value,
                        rank,
                    )]);
                }
            }
            continue;
        }

        let child = kv.get_ptr();
        let cp = key.common_prefix_len(&kv.key);
        if cp == kv.key.bits() && key.bits() > cp {
            // The edge is a proper prefix of the key: the bound continues
            // inside this child.
            match bound_rec(ctx, child, key.suffix(cp), strict) {
                Bound::Found(mut sub) => {
                    let mut entries =
                        vec![TriePathEntry::non_terminal(kv.key.bits(), child, rank)];
                    entries.append(&mut sub);
                    return Bound::Found(entries);
                }
                Bound::NotFound(skipped) => {
                    rank += skipped;
                    continue;
                }
            }
        }
        if cp == key.bits() || key.get_bits(1, cp) == 0 {
            // Everything under the child is strictly greater than the key;
            // its first value is the bound.
            let mut entries = vec![TriePathEntry::non_terminal(kv.key.bits(), child, rank)];
            let mut at = child;
            loop {
                let entry = node::first(ctx, at);
                let next = entry.is_non_terminal().then(|| entry.node());
                entries.push(entry);
                match next {
                    Some(n) => at = n,
                    None => break,
                }
            }
            return Bound::Found(entries);
        }
        // Everything under the child is smaller.
        rank += node::size(ctx, child);
    }
    Bound::NotFound(rank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::epoch::GcLock;
    use crate::kv::Kv;
    use crate::node::{build, GcList, State};
    use crate::region::{page_size, Region};
    use std::sync::Arc;

    fn with_trie<R>(
        keys: &[(u64, u64)],
        f: impl FnOnce(&Ctx, TriePtr) -> R,
    ) -> R {
        let region = Region::anonymous(Arc::new(GcLock::new()), 64 * page_size()).unwrap();
        let arena = Arena::new(region.clone());
        let pin = region.pin();
        arena.format(&pin);
        let ctx = Ctx::new(&pin, &arena);
        let mut gc = GcList::new();
        let mut kvs: Vec<Kv> = keys
            .iter()
            .map(|(k, v)| Kv::value(KeyFragment::from_bytes(&k.to_be_bytes()), *v))
            .collect();
        kvs.sort_by(|a, b| a.key.cmp(&b.key));
        let root = build(&ctx, &mut gc, &kvs, State::CopyOnWrite).unwrap();
        f(&ctx, root)
    }

    fn seq(n: u64) -> Vec<(u64, u64)> {
        (0..n).map(|i| (i, i * 10)).collect()
    }

    #[test]
    fn find_key_hits_every_entry() {
        with_trie(&seq(100), |ctx, root| {
            assert_eq!(node::size(ctx, root), 100);
            for i in 0..100u64 {
                let key = KeyFragment::from_bytes(&i.to_be_bytes());
                let path = find_key(ctx, root, &key);
                assert!(path.valid(), "missing key {i}");
                assert_eq!(path.value(), i * 10);
                assert_eq!(path.total_bits(), 64);
                assert_eq!(path.key(ctx), key);
            }
            let missing = KeyFragment::from_bytes(&1234u64.to_be_bytes());
            assert!(!find_key(ctx, root, &missing).valid());
        });
    }

    #[test]
    fn find_index_matches_rank_order() {
        with_trie(&seq(64), |ctx, root| {
            for i in 0..64u64 {
                let path = find_index(ctx, root, i);
                assert!(path.valid());
                assert_eq!(path.value(), i * 10);
                assert_eq!(path.entry_num(), i);
            }
            assert!(!find_index(ctx, root, 64).valid());
        });
    }

    #[test]
    fn begin_end_and_advance() {
        with_trie(&seq(32), |ctx, root| {
            let first = begin(ctx, root);
            assert!(first.valid());
            assert_eq!(first.value(), 0);

            let mut path = first;
            for i in 1..32u64 {
                path = advance(ctx, &path, 1);
                assert_eq!(path.value(), i * 10);
            }
            path = advance(ctx, &path, 1);
            assert!(!path.valid());

            let back = advance(ctx, &path, -32);
            assert_eq!(back.value(), 0);
        });
    }

    #[test]
    fn bounds() {
        with_trie(&[(10, 1), (20, 2), (30, 3)], |ctx, root| {
            let key = |k: u64| KeyFragment::from_bytes(&k.to_be_bytes());

            let lb = find_bound(ctx, root, &key(20), false);
            assert_eq!(lb.value(), 2);
            let ub = find_bound(ctx, root, &key(20), true);
            assert_eq!(ub.value(), 3);

            let lb = find_bound(ctx, root, &key(15), false);
            assert_eq!(lb.value(), 2);
            let lb = find_bound(ctx, root, &key(0), false);
            assert_eq!(lb.value(), 1);
            let past = find_bound(ctx, root, &key(31), false);
            assert!(!past.valid());
        });
    }
}
