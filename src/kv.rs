//! Key-value pairs passed between trie nodes.

use std::fmt;

use crate::frag::KeyFragment;
use crate::node::TriePtr;

/// One entry of a node: a key fragment and either an opaque 64-bit value or
/// a child subtree pointer.
#[derive(Clone, PartialEq, Eq)]
pub struct Kv {
    pub key: KeyFragment,
    pub value: u64,
    pub is_ptr: bool,
}

impl Kv {
    pub fn value(key: KeyFragment, value: u64) -> Kv {
        Kv {
            key,
            value,
            is_ptr: false,
        }
    }

    pub fn child(key: KeyFragment, ptr: TriePtr) -> Kv {
        Kv {
            key,
            value: ptr.bits(),
            is_ptr: true,
        }
    }

    pub fn get_value(&self) -> u64 {
        debug_assert!(!self.is_ptr);
        self.value
    }

    pub fn get_ptr(&self) -> TriePtr {
        debug_assert!(self.is_ptr);
        TriePtr::from_bits(self.value)
    }
}

impl fmt::Debug for Kv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ptr {
            write!(f, "{{ {:?} - {:?} }}", self.key, self.get_ptr())
        } else {
            write!(f, "{{ {:?} - {} }}", self.key, self.value)
        }
    }
}

pub type KvList = Vec<Kv>;

pub fn has_ptr(kvs: &[Kv]) -> bool {
    kvs.iter().any(|kv| kv.is_ptr)
}

/// Longest prefix shared by every key of the list.
pub fn common_prefix(kvs: &[Kv]) -> KeyFragment {
    let Some(first) = kvs.first() else {
        return KeyFragment::empty();
    };
    let mut len = first.key.bits();
    for kv in &kvs[1..] {
        len = len.min(first.key.common_prefix_len(&kv.key));
    }
    first.key.prefix(len)
}

/// Prepend `prefix` to every key.
pub fn prefix_keys(kvs: &[Kv], prefix: &KeyFragment) -> KvList {
    kvs.iter()
        .map(|kv| Kv {
            key: prefix.concat(&kv.key),
            value: kv.value,
            is_ptr: kv.is_ptr,
        })
        .collect()
}

/// The contiguous run of entries whose keys start with `prefix`.
pub fn narrow(kvs: &[Kv], prefix: &KeyFragment) -> KvList {
    let mut first = 0;
    while first < kvs.len() && !kvs[first].key.starts_with(prefix) {
        first += 1;
    }
    let mut last = first;
    while last < kvs.len() && kvs[last].key.starts_with(prefix) {
        last += 1;
    }
    kvs[first..last].to_vec()
}

/// Insert `kv` keeping the list sorted by key; returns its position.
pub fn insert_kv(kvs: &mut KvList, kv: Kv) -> usize {
    let pos = kvs
        .iter()
        .position(|other| other.key >= kv.key)
        .unwrap_or(kvs.len());
    kvs.insert(pos, kv);
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_prefix_and_narrow() {
        let kvs = vec![
            Kv::value(KeyFragment::from_bytes(&[0x10, 0x01]), 1),
            Kv::value(KeyFragment::from_bytes(&[0x10, 0x02]), 2),
            Kv::value(KeyFragment::from_bytes(&[0x11, 0x00]), 3),
        ];
        let cp = common_prefix(&kvs);
        assert_eq!(cp.bits(), 7);

        let narrowed = narrow(&kvs, &KeyFragment::from_bytes(&[0x10]));
        assert_eq!(narrowed.len(), 2);
        assert_eq!(narrowed[0].value, 1);
    }

    #[test]
    fn sorted_insert() {
        let mut kvs = vec![
            Kv::value(KeyFragment::new(1, 8), 1),
            Kv::value(KeyFragment::new(3, 8), 3),
        ];
        let pos = insert_kv(&mut kvs, Kv::value(KeyFragment::new(2, 8), 2));
        assert_eq!(pos, 1);
        assert_eq!(kvs.len(), 3);
        assert!(kvs.windows(2).all(|w| w[0].key < w[1].key));
    }
}
