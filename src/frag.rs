//! Bit-string key fragments.
//!
//! A fragment is matched from the most significant bit to the least
//! significant bit. Prefix removal is O(1) amortised: `remove_bits` only
//! advances a lazy `start_bit` and the storage is re-packed on demand.

use std::cmp::Ordering;
use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::arena::Arena;
use crate::error::OpResult;
use crate::region::Pin;

const BITS_IN_WORD: usize = 64;

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Extract `n <= 64` bits starting at bit position `start` of an MSB-first
/// packed word slice.
fn extract(words: &[u64], start: usize, n: usize) -> u64 {
    debug_assert!(n <= 64);
    if n == 0 {
        return 0;
    }
    let w = start / BITS_IN_WORD;
    let b = start % BITS_IN_WORD;
    let avail = BITS_IN_WORD - b;
    let first = words[w] << b;
    if n <= avail {
        first >> (BITS_IN_WORD - n)
    } else {
        let rest = n - avail;
        (first >> (BITS_IN_WORD - n)) | (words[w + 1] >> (BITS_IN_WORD - rest))
    }
}

/// Write the low `n` bits of `val` at bit position `start`, MSB-first.
fn deposit(words: &mut [u64], start: usize, val: u64, n: usize) {
    if n == 0 {
        return;
    }
    let val = if n == BITS_IN_WORD {
        val
    } else {
        val & ((1u64 << n) - 1)
    };
    let w = start / BITS_IN_WORD;
    let b = start % BITS_IN_WORD;
    let avail = BITS_IN_WORD - b;
    if n <= avail {
        let shift = avail - n;
        let mask = (((1u128 << n) - 1) as u64) << shift;
        words[w] = (words[w] & !mask) | (val << shift);
    } else {
        let rest = n - avail;
        let mask = (1u64 << avail) - 1;
        words[w] = (words[w] & !mask) | (val >> rest);
        let mask2 = !0u64 << (BITS_IN_WORD - rest);
        words[w + 1] = (words[w + 1] & !mask2) | (val << (BITS_IN_WORD - rest));
    }
}

/*****************************************************************************/
/* KEY FRAGMENT                                                              */
/*****************************************************************************/

#[derive(Clone, Default)]
pub struct KeyFragment {
    words: Vec<u64>,
    bits: usize,
    start_bit: usize,
}

impl KeyFragment {
    /// Fragment of `bits <= 64` bits taken from the low bits of `key`.
    pub fn new(key: u64, bits: usize) -> Self {
        assert!(bits <= 64, "too many bits for an inline fragment");
        let mut words = Vec::new();
        if bits > 0 {
            words.push(key << (BITS_IN_WORD - bits));
        }
        KeyFragment {
            words,
            bits,
            start_bit: 0,
        }
    }

    pub fn from_words(words: Vec<u64>, bits: usize) -> Self {
        debug_assert!(words.len() >= ceil_div(bits, BITS_IN_WORD));
        KeyFragment {
            words,
            bits,
            start_bit: 0,
        }
    }

    /// Whole-byte fragment, first byte at the most significant end.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let bits = bytes.len() * 8;
        let mut words = vec![0u64; ceil_div(bits, BITS_IN_WORD)];
        for (i, b) in bytes.iter().enumerate() {
            deposit(&mut words, i * 8, *b as u64, 8);
        }
        KeyFragment {
            words,
            bits,
            start_bit: 0,
        }
    }

    /// Packed big-endian bytes; `bits` must be a multiple of 8.
    pub fn to_bytes(&self) -> Vec<u8> {
        debug_assert_eq!(self.bits % 8, 0, "fragment is not whole bytes");
        let mut out = Vec::with_capacity(self.bits / 8);
        for i in 0..self.bits / 8 {
            out.push(self.get_bits(8, i * 8) as u8);
        }
        out
    }

    pub fn empty() -> Self {
        KeyFragment::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    /// The first `n <= 64` bits after skipping `done` bits.
    pub fn get_bits(&self, n: usize, done: usize) -> u64 {
        assert!(n <= 64, "too many bits to extract at once");
        assert!(n + done <= self.bits, "not enough bits left to extract");
        if n == 0 {
            return 0;
        }
        extract(&self.words, self.start_bit + done, n)
    }

    fn get_word_vec(&self, n: usize, done: usize) -> Vec<u64> {
        assert!(n + done <= self.bits);
        let mut out = vec![0u64; ceil_div(n, BITS_IN_WORD)];
        let mut at = 0;
        while at < n {
            let chunk = (n - at).min(BITS_IN_WORD);
            deposit(&mut out, at, extract(&self.words, self.start_bit + done + at, chunk), chunk);
            at += chunk;
        }
        out
    }

    /// Remove and return the first `n <= 64` bits.
    pub fn remove_bits(&mut self, n: usize) -> u64 {
        let result = self.get_bits(n, 0);
        self.start_bit += n;
        self.bits -= n;
        result
    }

    /// Drop the first `n` bits without extracting them.
    pub fn drop_bits(&mut self, n: usize) {
        assert!(n <= self.bits);
        self.start_bit += n;
        self.bits -= n;
    }

    pub fn prefix(&self, n: usize) -> KeyFragment {
        KeyFragment::from_words(self.get_word_vec(n, 0), n)
    }

    /// The fragment left over once the first `n` bits are removed.
    pub fn suffix(&self, n: usize) -> KeyFragment {
        let rest = self.bits - n;
        KeyFragment::from_words(self.get_word_vec(rest, n), rest)
    }

    /// Length of the longest common prefix, compared 64 bits at a stride.
    pub fn common_prefix_len(&self, other: &KeyFragment) -> usize {
        let shortest = self.bits.min(other.bits);
        let mut done = 0;
        while done < shortest {
            let chunk = (shortest - done).min(BITS_IN_WORD);
            let a = self.get_bits(chunk, done);
            let b = other.get_bits(chunk, done);
            if a != b {
                let diff = a ^ b;
                // highest set bit of diff, counted from the chunk's MSB
                let same = diff.leading_zeros() as usize - (BITS_IN_WORD - chunk);
                return done + same;
            }
            done += chunk;
        }
        shortest
    }

    pub fn common_prefix(&self, other: &KeyFragment) -> KeyFragment {
        self.prefix(self.common_prefix_len(other))
    }

    /// True iff `other` is a prefix of `self`; if so, removes it.
    pub fn consume(&mut self, other: &KeyFragment) -> bool {
        if other.bits > self.bits {
            return false;
        }
        if self.common_prefix_len(other) != other.bits {
            return false;
        }
        self.drop_bits(other.bits);
        true
    }

    pub fn starts_with(&self, other: &KeyFragment) -> bool {
        other.bits <= self.bits && self.common_prefix_len(other) == other.bits
    }

    pub fn concat(&self, other: &KeyFragment) -> KeyFragment {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let bits = self.bits + other.bits;
        let mut words = vec![0u64; ceil_div(bits, BITS_IN_WORD)];
        let mut at = 0;
        while at < self.bits {
            let chunk = (self.bits - at).min(BITS_IN_WORD);
            deposit(&mut words, at, self.get_bits(chunk, at), chunk);
            at += chunk;
        }
        let mut at = 0;
        while at < other.bits {
            let chunk = (other.bits - at).min(BITS_IN_WORD);
            deposit(&mut words, self.bits + at, other.get_bits(chunk, at), chunk);
            at += chunk;
        }
        KeyFragment::from_words(words, bits)
    }

    /// Re-pack the storage so `start_bit` is zero.
    pub fn trim(&mut self) {
        if self.start_bit == 0 {
            return;
        }
        self.words = self.get_word_vec(self.bits, 0);
        self.start_bit = 0;
    }
}

impl PartialEq for KeyFragment {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits && self.common_prefix_len(other) == self.bits
    }
}

impl Eq for KeyFragment {}

impl PartialOrd for KeyFragment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyFragment {
    /// Bit-lexicographic: a proper prefix sorts before its extensions.
    fn cmp(&self, other: &Self) -> Ordering {
        let shortest = self.bits.min(other.bits);
        let mut done = 0;
        while done < shortest {
            let chunk = (shortest - done).min(BITS_IN_WORD);
            let a = self.get_bits(chunk, done);
            let b = other.get_bits(chunk, done);
            match a.cmp(&b) {
                Ordering::Equal => done += chunk,
                ord => return ord,
            }
        }
        self.bits.cmp(&other.bits)
    }
}

impl fmt::Debug for KeyFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[", self.bits)?;
        let mut done = 0;
        while done < self.bits {
            let chunk = (self.bits - done).min(16);
            write!(f, "{:01$b}", self.get_bits(chunk, done), chunk)?;
            done += chunk;
        }
        write!(f, "]")
    }
}

/*****************************************************************************/
/* KEY FRAGMENT REPR                                                         */
/*****************************************************************************/

/// On-region representation of a fragment.
///
/// Fragments of 64 bits or fewer are stored right-aligned in `data`.
/// Longer fragments live in an external blob whose first two bytes are a
/// refcount, letting immutable fragments be shared between nodes.
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
#[repr(C)]
pub struct KeyFragmentRepr {
    pub data: u64,
    pub bits: i32,
    _pad: u32,
}

const BLOB_HEADER: usize = 2; // u16 refcount

impl KeyFragmentRepr {
    pub fn invalid() -> Self {
        KeyFragmentRepr {
            data: 0,
            bits: -1,
            _pad: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.bits >= 0
    }

    pub fn is_inline(&self) -> bool {
        self.bits <= 64
    }

    pub fn offset(&self) -> u64 {
        debug_assert!(self.is_valid() && !self.is_inline());
        self.data
    }

    /// Bytes directly owned in the region (zero for inline reprs).
    pub fn direct_mem_usage(&self) -> usize {
        if self.is_inline() {
            0
        } else {
            ceil_div(self.bits as usize, 8) + BLOB_HEADER
        }
    }
}

impl fmt::Debug for KeyFragmentRepr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            write!(f, "repr(invalid)")
        } else if self.is_inline() {
            write!(f, "repr({}:{:x})", self.bits, self.data)
        } else {
            write!(f, "repr({}@{:#x})", self.bits, self.data)
        }
    }
}

impl KeyFragment {
    /// Store this fragment in the region. Long fragments allocate a
    /// refcounted blob which must be released with [`dealloc_repr`].
    ///
    /// [`dealloc_repr`]: KeyFragment::dealloc_repr
    pub fn alloc_repr(&self, pin: &Pin, arena: &Arena) -> OpResult<KeyFragmentRepr> {
        if self.bits <= 64 {
            return Ok(KeyFragmentRepr {
                data: self.get_bits(self.bits, 0),
                bits: self.bits as i32,
                _pad: 0,
            });
        }
        let nbytes = ceil_div(self.bits, 8);
        let off = arena.allocate(pin, (nbytes + BLOB_HEADER) as u64)?;
        pin.write::<u16>(off, &1u16);
        let mut bytes = Vec::with_capacity(nbytes);
        let mut done = 0;
        while done < self.bits {
            let chunk = (self.bits - done).min(8);
            bytes.push((self.get_bits(chunk, done) << (8 - chunk)) as u8);
            done += 8;
        }
        pin.write_bytes(off + BLOB_HEADER as u64, &bytes);
        Ok(KeyFragmentRepr {
            data: off,
            bits: self.bits as i32,
            _pad: 0,
        })
    }

    pub fn load_repr(repr: &KeyFragmentRepr, pin: &Pin) -> KeyFragment {
        assert!(repr.is_valid(), "loading an invalid key fragment repr");
        if repr.is_inline() {
            return KeyFragment::new(repr.data, repr.bits as usize);
        }
        let bits = repr.bits as usize;
        let nbytes = ceil_div(bits, 8);
        let bytes = pin.bytes(repr.offset() + BLOB_HEADER as u64, nbytes);
        let mut words = vec![0u64; ceil_div(bits, BITS_IN_WORD)];
        for (i, b) in bytes.iter().enumerate() {
            let chunk = (bits - i * 8).min(8);
            deposit(&mut words, i * 8, (*b >> (8 - chunk)) as u64, chunk);
        }
        KeyFragment::from_words(words, bits)
    }

    /// Drop one reference to the repr's blob, freeing it at zero.
    /// No-op for inline reprs.
    pub fn dealloc_repr(repr: &KeyFragmentRepr, pin: &Pin, arena: &Arena) {
        if !repr.is_valid() || repr.is_inline() {
            return;
        }
        let rc = pin
            .atomic_u16(repr.offset())
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        debug_assert!(rc > 0, "double free of a key fragment blob");
        if rc == 1 {
            arena.deallocate(pin, repr.offset());
        }
    }

    /// Share the repr: bump the blob refcount and return it unchanged.
    /// Concurrent cloners of one node race on the count, so it is atomic.
    pub fn copy_repr(repr: &KeyFragmentRepr, pin: &Pin) -> KeyFragmentRepr {
        if repr.is_valid() && !repr.is_inline() {
            pin.atomic_u16(repr.offset())
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            pin.mark_dirty(repr.offset(), 2);
        }
        *repr
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn frag() -> impl Strategy<Value = KeyFragment> {
        proptest::collection::vec(any::<u8>(), 0..24).prop_map(|b| KeyFragment::from_bytes(&b))
    }

    proptest! {
        #[test]
        fn concat_splits_back(a in frag(), b in frag()) {
            let ab = a.concat(&b);
            let a_bits = a.bits();
            prop_assert_eq!(ab.bits(), a_bits + b.bits());
            prop_assert_eq!(ab.prefix(a_bits), a);
            prop_assert_eq!(ab.suffix(a_bits), b);
        }

        #[test]
        fn order_matches_byte_order(
            a in proptest::collection::vec(any::<u8>(), 0..16),
            b in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            let fa = KeyFragment::from_bytes(&a);
            let fb = KeyFragment::from_bytes(&b);
            prop_assert_eq!(fa.cmp(&fb), a.cmp(&b));
        }

        #[test]
        fn common_prefix_is_maximal(a in frag(), b in frag()) {
            let cp = a.common_prefix_len(&b);
            prop_assert!(a.prefix(cp) == b.prefix(cp));
            if cp < a.bits() && cp < b.bits() {
                prop_assert_ne!(a.get_bits(1, cp), b.get_bits(1, cp));
            }
        }

        #[test]
        fn lazy_removal_equals_suffix(bytes in proptest::collection::vec(any::<u8>(), 1..24),
                                      cut in 0usize..8) {
            let full = KeyFragment::from_bytes(&bytes);
            let cut = cut.min(full.bits());
            let mut lazy = full.clone();
            lazy.drop_bits(cut);
            prop_assert_eq!(lazy, full.suffix(cut));
        }
    }
}
