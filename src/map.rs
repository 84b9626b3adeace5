//! Strongly-typed maps over trie slots.
//!
//! Keys marshal to prefix-free whole-byte fragments through [`TrieKey`];
//! values either fit the 64-bit leaf slot directly or live in the region
//! through the allocator ([`TrieValue`]). Removed values are released
//! through the epoch manager so concurrent readers finish first, and an
//! optional user deallocator observes every value the map drops.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use log::trace;

use crate::error::{OpResult, Result};
use crate::frag::KeyFragment;
use crate::merge;
use crate::node::Ctx;
use crate::path::{self, TriePath};
use crate::trie::{CasOutcome, Trie, TrieVersion};
use crate::txn::TrieTransaction;

/*****************************************************************************/
/* KEY / VALUE MARSHALLING                                                   */
/*****************************************************************************/

/// A key encodable as a prefix-free, whole-byte fragment whose bit order
/// matches the type's ordering.
pub trait TrieKey: Clone {
    fn to_fragment(&self) -> KeyFragment;
    fn from_fragment(frag: &KeyFragment) -> Self;
}

impl TrieKey for u64 {
    fn to_fragment(&self) -> KeyFragment {
        KeyFragment::from_bytes(&self.to_be_bytes())
    }

    fn from_fragment(frag: &KeyFragment) -> Self {
        u64::from_be_bytes(frag.to_bytes().try_into().expect("u64 key width"))
    }
}

impl TrieKey for i64 {
    fn to_fragment(&self) -> KeyFragment {
        // Flip the sign bit so negative keys order before positive ones.
        KeyFragment::from_bytes(&((*self as u64) ^ (1 << 63)).to_be_bytes())
    }

    fn from_fragment(frag: &KeyFragment) -> Self {
        (u64::from_be_bytes(frag.to_bytes().try_into().expect("i64 key width")) ^ (1 << 63)) as i64
    }
}

impl TrieKey for u32 {
    fn to_fragment(&self) -> KeyFragment {
        KeyFragment::from_bytes(&self.to_be_bytes())
    }

    fn from_fragment(frag: &KeyFragment) -> Self {
        u32::from_be_bytes(frag.to_bytes().try_into().expect("u32 key width"))
    }
}

/// Byte strings escape interior zeros (`00` becomes `00 FF`) and terminate
/// with `00 00`, which keeps the encoding prefix-free while preserving
/// plain lexicographic order.
impl TrieKey for Vec<u8> {
    fn to_fragment(&self) -> KeyFragment {
        let mut out = Vec::with_capacity(self.len() + 2);
        for b in self {
            out.push(*b);
            if *b == 0 {
                out.push(0xff);
            }
        }
        out.push(0);
        out.push(0);
        KeyFragment::from_bytes(&out)
    }

    fn from_fragment(frag: &KeyFragment) -> Self {
        let bytes = frag.to_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == 0 {
                if bytes.get(i + 1) == Some(&0xff) {
                    out.push(0);
                    i += 2;
                    continue;
                }
                break; // terminator
            }
            out.push(bytes[i]);
            i += 1;
        }
        out
    }
}

impl TrieKey for String {
    fn to_fragment(&self) -> KeyFragment {
        self.as_bytes().to_vec().to_fragment()
    }

    fn from_fragment(frag: &KeyFragment) -> Self {
        String::from_utf8(Vec::<u8>::from_fragment(frag)).expect("utf-8 key")
    }
}

/// A value held in the 64-bit leaf slot, directly or through the
/// allocator.
pub trait TrieValue: Clone + PartialEq {
    fn store(&self, ctx: &Ctx) -> OpResult<u64>;
    fn load(bits: u64, ctx: &Ctx) -> Self;
    /// Release whatever `store` allocated. A no-op for inline values.
    fn dealloc(bits: u64, ctx: &Ctx);
}

macro_rules! inline_value {
    ($t:ty) => {
        impl TrieValue for $t {
            fn store(&self, _ctx: &Ctx) -> OpResult<u64> {
                Ok(*self as u64)
            }

            fn load(bits: u64, _ctx: &Ctx) -> Self {
                bits as $t
            }

            fn dealloc(_bits: u64, _ctx: &Ctx) {}
        }
    };
}

inline_value!(u64);
inline_value!(u32);
inline_value!(i64);

/// Blob values: `[len u32][bytes]` in the allocator, offset in the leaf.
impl TrieValue for Vec<u8> {
    fn store(&self, ctx: &Ctx) -> OpResult<u64> {
        let off = ctx.arena.allocate(ctx.pin, self.len() as u64 + 4)?;
        ctx.pin.write::<u32>(off, &(self.len() as u32));
        ctx.pin.write_bytes(off + 4, self);
        Ok(off)
    }

    fn load(bits: u64, ctx: &Ctx) -> Self {
        let len: u32 = ctx.pin.read(bits);
        ctx.pin.bytes(bits + 4, len as usize).to_vec()
    }

    fn dealloc(bits: u64, ctx: &Ctx) {
        ctx.arena.deallocate(ctx.pin, bits);
    }
}

impl TrieValue for String {
    fn store(&self, ctx: &Ctx) -> OpResult<u64> {
        self.as_bytes().to_vec().store(ctx)
    }

    fn load(bits: u64, ctx: &Ctx) -> Self {
        String::from_utf8(Vec::<u8>::load(bits, ctx)).expect("utf-8 value")
    }

    fn dealloc(bits: u64, ctx: &Ctx) {
        Vec::<u8>::dealloc(bits, ctx);
    }
}

/*****************************************************************************/
/* MAP                                                                       */
/*****************************************************************************/

/// Deallocation hook observing every `(key, value)` the map releases.
pub type RemoveHook<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

/// A thread-safe ordered map with single-operation linearisability.
pub struct Map<K, V> {
    trie: Arc<Trie>,
    on_remove: Option<RemoveHook<K, V>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for Map<K, V> {
    fn clone(&self) -> Self {
        Map {
            trie: self.trie.clone(),
            on_remove: self.on_remove.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> Map<K, V>
where
    K: TrieKey + 'static,
    V: TrieValue + 'static,
{
    pub(crate) fn over(trie: Arc<Trie>) -> Map<K, V> {
        Map {
            trie,
            on_remove: None,
            _marker: PhantomData,
        }
    }

    /// Install a deallocator invoked (after the grace period) for every
    /// value removed by a commit, a rollback of an insert, or a direct
    /// remove or replace.
    pub fn with_value_dealloc(mut self, hook: RemoveHook<K, V>) -> Self {
        self.on_remove = Some(hook);
        self
    }

    pub(crate) fn trie(&self) -> &Arc<Trie> {
        &self.trie
    }

    /// Run the hooks and release one value's storage. Called through the
    /// epoch manager unless the value never left a private workspace.
    fn release_value(&self, ctx: &Ctx, frag: &KeyFragment, bits: u64) {
        if let Some(hook) = self.on_remove.as_ref() {
            let key = K::from_fragment(frag);
            let value = V::load(bits, ctx);
            hook(&key, &value);
        }
        V::dealloc(bits, ctx);
    }

    /// Defer the release of removed values past all live epochs.
    fn schedule_release(&self, values: Vec<(KeyFragment, u64)>) {
        if values.is_empty() {
            return;
        }
        let map = self.clone();
        let region = self.trie.region().clone();
        let arena = self.trie.arena().clone();
        self.trie.region().gc().defer(Box::new(move || {
            let pin = region.pin();
            let ctx = Ctx::new(&pin, &arena);
            for (frag, bits) in &values {
                map.release_value(&ctx, frag, *bits);
            }
        }));
    }

    /// Store a value, retrying through region moves.
    fn store_value(&self, value: &V) -> Result<u64> {
        self.trie.with_retry(|ctx| value.store(ctx))
    }

    fn drop_stored(&self, bits: u64) {
        let pin = self.trie.region().pin();
        let ctx = Ctx::new(&pin, self.trie.arena());
        V::dealloc(bits, &ctx);
    }

    /// Insert `(key, value)`. False when the key already exists (the value
    /// is released). The iterator points at the key in a fresh version.
    pub fn insert(&self, key: &K, value: V) -> Result<(MapIter<K, V>, bool)> {
        let frag = key.to_fragment();
        let bits = self.store_value(&value)?;
        let inserted = self.trie.insert(&frag, bits)?;
        if !inserted {
            self.drop_stored(bits);
        }
        Ok((self.current().lower_bound_fragment(&frag), inserted))
    }

    /// Replace the value at `key`, returning the old one; absent keys stay
    /// absent and the new value is released.
    pub fn replace(&self, key: &K, value: V) -> Result<(MapIter<K, V>, Option<V>)> {
        let frag = key.to_fragment();
        let bits = self.store_value(&value)?;
        match self.trie.replace(&frag, bits)? {
            Some(old_bits) => {
                let old = {
                    let pin = self.trie.region().pin();
                    let ctx = Ctx::new(&pin, self.trie.arena());
                    V::load(old_bits, &ctx)
                };
                self.schedule_release(vec![(frag.clone(), old_bits)]);
                Ok((self.current().lower_bound_fragment(&frag), Some(old)))
            }
            None => {
                self.drop_stored(bits);
                Ok((self.current().end(), None))
            }
        }
    }

    /// Remove `key`; true when it was present.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let frag = key.to_fragment();
        match self.trie.remove(&frag)? {
            Some(bits) => {
                self.schedule_release(vec![(frag, bits)]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Swap `old` for `new` at `key`, looping until it succeeds or the
    /// value diverges. Returns the value seen last; `new` is released on
    /// failure.
    pub fn compare_and_swap(&self, key: &K, old: &V, new: V) -> Result<(MapIter<K, V>, V)> {
        enum Probe<V> {
            Missing,
            Diverged(V),
            Held(u64),
        }
        let frag = key.to_fragment();
        let new_bits = self.store_value(&new)?;
        loop {
            let probe = {
                let version = self.trie.current();
                let pin = self.trie.region().pin();
                let ctx = Ctx::new(&pin, self.trie.arena());
                let found = path::find_key(&ctx, version.root(), &frag);
                if !found.valid() {
                    Probe::Missing
                } else {
                    let bits = found.value();
                    let cur = V::load(bits, &ctx);
                    if cur != *old {
                        Probe::Diverged(cur)
                    } else {
                        Probe::Held(bits)
                    }
                }
            };
            match probe {
                Probe::Missing => {
                    self.drop_stored(new_bits);
                    return Ok((self.current().end(), old.clone()));
                }
                Probe::Diverged(cur) => {
                    self.drop_stored(new_bits);
                    return Ok((self.current().lower_bound_fragment(&frag), cur));
                }
                Probe::Held(cur_bits) => {
                    match self.trie.compare_and_swap(&frag, cur_bits, new_bits)? {
                        CasOutcome::Swapped => {
                            self.schedule_release(vec![(frag.clone(), cur_bits)]);
                            return Ok((
                                self.current().lower_bound_fragment(&frag),
                                old.clone(),
                            ));
                        }
                        CasOutcome::Mismatch(_) | CasOutcome::Missing => continue,
                    }
                }
            }
        }
    }

    /// An immutable snapshot; all reads through it observe one root.
    pub fn current(&self) -> MapVersion<K, V> {
        MapVersion {
            version: Arc::new(self.trie.current()),
            _marker: PhantomData,
        }
    }

    pub fn size(&self) -> u64 {
        self.trie.size()
    }

    pub fn find(&self, key: &K) -> Result<Option<V>> {
        Ok(self.current().find(key))
    }

    /// Fork a private transactional workspace.
    pub fn transaction(&self) -> MapTransaction<'_, K, V> {
        MapTransaction {
            map: self,
            txn: self.trie.transaction(),
            owned: HashSet::new(),
        }
    }
}

impl<K> Map<K, u64>
where
    K: TrieKey + 'static,
{
    /// Atomic read-modify-write: add `delta` at `key` through a CAS loop,
    /// inserting `delta` when the key is absent. Returns the prior value.
    pub fn fetch_and_add(&self, key: &K, delta: u64) -> Result<u64> {
        let frag = key.to_fragment();
        loop {
            let cur = {
                let version = self.trie.current();
                version.find(&frag)
            };
            match cur {
                None => {
                    if self.trie.insert(&frag, delta)? {
                        return Ok(0);
                    }
                }
                Some(cur) => {
                    if let CasOutcome::Swapped =
                        self.trie.compare_and_swap(&frag, cur, cur.wrapping_add(delta))?
                    {
                        return Ok(cur);
                    }
                }
            }
        }
    }
}

/*****************************************************************************/
/* VERSION & ITERATORS                                                       */
/*****************************************************************************/

/// An immutable snapshot of one map. Holds its epoch until dropped.
pub struct MapVersion<K, V> {
    version: Arc<TrieVersion>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for MapVersion<K, V> {
    fn clone(&self) -> Self {
        MapVersion {
            version: self.version.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> MapVersion<K, V>
where
    K: TrieKey + 'static,
    V: TrieValue + 'static,
{
    fn iter_at(&self, path: TriePath) -> MapIter<K, V> {
        MapIter {
            version: self.version.clone(),
            path,
            _marker: PhantomData,
        }
    }

    pub fn size(&self) -> u64 {
        self.version.size()
    }

    pub fn count(&self, key: &K) -> u64 {
        self.find(key).is_some() as u64
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let frag = key.to_fragment();
        self.version.with_ctx(|ctx| {
            let found = path::find_key(ctx, self.version.root(), &frag);
            found.valid().then(|| V::load(found.value(), ctx))
        })
    }

    /// Iterator at `key`, or the end iterator when absent.
    pub fn get(&self, key: &K) -> MapIter<K, V> {
        let frag = key.to_fragment();
        let path = self.version.with_ctx(|ctx| {
            let found = path::find_key(ctx, self.version.root(), &frag);
            if found.valid() {
                found
            } else {
                path::end(ctx, self.version.root())
            }
        });
        self.iter_at(path)
    }

    pub fn begin(&self) -> MapIter<K, V> {
        let path = self
            .version
            .with_ctx(|ctx| path::begin(ctx, self.version.root()));
        self.iter_at(path)
    }

    pub fn end(&self) -> MapIter<K, V> {
        let path = self
            .version
            .with_ctx(|ctx| path::end(ctx, self.version.root()));
        self.iter_at(path)
    }

    pub fn lower_bound(&self, key: &K) -> MapIter<K, V> {
        self.lower_bound_fragment(&key.to_fragment())
    }

    pub fn upper_bound(&self, key: &K) -> MapIter<K, V> {
        let frag = key.to_fragment();
        let path = self
            .version
            .with_ctx(|ctx| path::find_bound(ctx, self.version.root(), &frag, true));
        self.iter_at(path)
    }

    /// `(lower_bound, upper_bound)` in one consistent version.
    pub fn bounds(&self, key: &K) -> (MapIter<K, V>, MapIter<K, V>) {
        (self.lower_bound(key), self.upper_bound(key))
    }

    pub(crate) fn lower_bound_fragment(&self, frag: &KeyFragment) -> MapIter<K, V> {
        let path = self
            .version
            .with_ctx(|ctx| path::find_bound(ctx, self.version.root(), frag, false));
        self.iter_at(path)
    }
}

/// A read-only cursor bound to one version.
pub struct MapIter<K, V> {
    version: Arc<TrieVersion>,
    path: TriePath,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> MapIter<K, V>
where
    K: TrieKey + 'static,
    V: TrieValue + 'static,
{
    pub fn is_end(&self) -> bool {
        !self.path.valid()
    }

    pub fn key(&self) -> K {
        assert!(!self.is_end(), "dereferencing the end iterator");
        let frag = self.version.with_ctx(|ctx| self.path.key(ctx));
        K::from_fragment(&frag)
    }

    pub fn value(&self) -> V {
        assert!(!self.is_end(), "dereferencing the end iterator");
        self.version
            .with_ctx(|ctx| V::load(self.path.value(), ctx))
    }

    pub fn entry(&self) -> (K, V) {
        (self.key(), self.value())
    }

    /// In-order rank of the cursor within its version.
    pub fn rank(&self) -> u64 {
        self.path.entry_num()
    }

    pub fn next(&mut self) {
        self.advance(1);
    }

    pub fn prev(&mut self) {
        self.advance(-1);
    }

    pub fn advance(&mut self, n: i64) {
        self.path = self
            .version
            .with_ctx(|ctx| path::advance(ctx, &self.path, n));
    }
}

impl<K, V> PartialEq for MapIter<K, V> {
    /// Iterators are only comparable within one version.
    fn eq(&self, other: &Self) -> bool {
        assert_eq!(
            self.version.root(),
            other.version.root(),
            "comparing iterators from different versions"
        );
        self.path.entry_num() == other.path.entry_num()
            && self.path.valid() == other.path.valid()
    }
}

impl<K, V> PartialOrd for MapIter<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        assert_eq!(
            self.version.root(),
            other.version.root(),
            "comparing iterators from different versions"
        );
        Some(self.path.entry_num().cmp(&other.path.entry_num()))
    }
}

/*****************************************************************************/
/* TRANSACTION                                                               */
/*****************************************************************************/

/// A typed view over a transactional workspace. Mutations are in-place and
/// private; `commit` merges them back, releasing displaced values through
/// the epoch manager. The transaction keeps a hash set of the keys whose
/// current value it allocated itself, so a value inserted (or re-replaced)
/// and then removed within the same transaction is still released.
pub struct MapTransaction<'m, K, V>
where
    K: TrieKey + 'static,
    V: TrieValue + 'static,
{
    map: &'m Map<K, V>,
    txn: TrieTransaction<'m>,
    /// Keys whose workspace value this transaction allocated.
    owned: HashSet<Vec<u8>>,
}

impl<'m, K, V> MapTransaction<'m, K, V>
where
    K: TrieKey + 'static,
    V: TrieValue + 'static,
{
    fn key_id(frag: &KeyFragment) -> Vec<u8> {
        frag.to_bytes()
    }

    pub fn size(&self) -> u64 {
        self.txn.size()
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let frag = key.to_fragment();
        let bits = self.txn.find(&frag)?;
        let pin = self.map.trie().region().pin();
        let ctx = Ctx::new(&pin, self.map.trie().arena());
        Some(V::load(bits, &ctx))
    }

    pub fn insert(&mut self, key: &K, value: V) -> Result<bool> {
        let frag = key.to_fragment();
        let bits = self.map.store_value(&value)?;
        if self.txn.insert(&frag, bits)? {
            self.owned.insert(Self::key_id(&frag));
            Ok(true)
        } else {
            // Key exists in the workspace; the value never escaped.
            self.map.drop_stored(bits);
            Ok(false)
        }
    }

    pub fn replace(&mut self, key: &K, value: V) -> Result<Option<V>> {
        let frag = key.to_fragment();
        let bits = self.map.store_value(&value)?;
        match self.txn.replace(&frag, bits)? {
            Some(old_bits) => {
                let pin = self.map.trie().region().pin();
                let ctx = Ctx::new(&pin, self.map.trie().arena());
                let old = V::load(old_bits, &ctx);
                if !self.owned.insert(Self::key_id(&frag)) {
                    // Replacing a value we allocated ourselves: it never
                    // escaped the workspace.
                    V::dealloc(old_bits, &ctx);
                }
                Ok(Some(old))
            }
            None => {
                self.map.drop_stored(bits);
                Ok(None)
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Result<bool> {
        let frag = key.to_fragment();
        match self.txn.remove(&frag)? {
            Some(bits) => {
                if self.owned.remove(&Self::key_id(&frag)) {
                    // Inserted then removed within this transaction: the
                    // value never reached the shared tree, release it now.
                    self.map.drop_stored(bits);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// See the transactional trie: clearing through a transaction is a
    /// precondition violation.
    pub fn clear(&mut self) -> ! {
        self.txn.clear()
    }

    /// Merge into the parent map with the default conflict resolutions
    /// (source value wins, removes proceed).
    pub fn commit(&mut self) -> Result<()> {
        let removed = self.txn.commit(
            &merge::default_insert_conflict,
            &merge::default_remove_conflict,
        )?;
        trace!("typed commit released {} values", removed.len());
        self.map.schedule_release(removed);
        Ok(())
    }

    /// Merge with caller-supplied conflict hooks over raw value slots.
    pub fn commit_with(
        &mut self,
        on_insert: &merge::InsertConflictFn,
        on_remove: &merge::RemoveConflictFn,
    ) -> Result<()> {
        let removed = self.txn.commit(on_insert, on_remove)?;
        self.map.schedule_release(removed);
        Ok(())
    }

    /// Non-blocking commit; false when another committer holds the mutex.
    pub fn try_commit(&mut self) -> Result<bool> {
        match self.txn.try_commit(
            &merge::default_insert_conflict,
            &merge::default_remove_conflict,
        )? {
            Some(removed) => {
                self.map.schedule_release(removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Abandon the workspace, releasing every value it allocated.
    pub fn rollback(&mut self) {
        let inserted = self.txn.rollback();
        if inserted.is_empty() {
            return;
        }
        let pin = self.map.trie().region().pin();
        let ctx = Ctx::new(&pin, self.map.trie().arena());
        for (_frag, bits) in inserted {
            V::dealloc(bits, &ctx);
        }
    }
}

impl<K, V> Drop for MapTransaction<'_, K, V>
where
    K: TrieKey + 'static,
    V: TrieValue + 'static,
{
    fn drop(&mut self) {
        if !self.txn.is_finished() {
            self.rollback();
        }
    }
}
