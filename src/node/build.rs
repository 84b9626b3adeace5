//! Node construction.
//!
//! `build` turns a sorted entry list into the smallest subtree that holds
//! it, choosing the node kind as a pure function of the list's shape: a
//! single entry becomes an inline/basic/large-key terminal by key size,
//! short shared-prefix lists compress, small lists stay sparse, and
//! anything bigger bursts into a branching node over the next one or four
//! bits. Removal paths reuse the same choice, so alternating inserts and
//! removes of one key cannot oscillate between shapes.

use super::layout::{
    self, BinaryBranchRepr, CompressedTermRepr, DenseBranchRepr, KeyedTermRepr, SparseBranchRepr,
    SparseTermRepr, BRANCH_BITS, COMPRESSED_SUFFIX_BITS, COMPRESSED_TERM_CAP, SPARSE_TERM_CAP,
};
use super::{ops, Ctx, GcList, NodeType, State, TriePtr};
use crate::error::OpResult;
use crate::kv::{self, Kv};

/// Build a subtree holding exactly `kvs` (sorted by key). Pointer entries
/// are reused as child subtrees wherever they land on a branch edge.
pub fn build(ctx: &Ctx, gc: &mut GcList, kvs: &[Kv], state: State) -> OpResult<TriePtr> {
    if kvs.is_empty() {
        return Ok(TriePtr::null());
    }
    debug_assert!(kvs.windows(2).all(|w| w[0].key < w[1].key), "unsorted kvs");

    if kvs.len() == 1 {
        let kv = &kvs[0];
        if kv.is_ptr {
            return ops::prefix_keys(ctx, gc, kv.get_ptr(), &kv.key, state);
        }
        return make_terminal(ctx, gc, kvs, state);
    }

    if !kv::has_ptr(kvs) && terminal_fits(kvs) {
        return make_terminal(ctx, gc, kvs, state);
    }

    make_branching(ctx, gc, kvs, state)
}

fn terminal_fits(kvs: &[Kv]) -> bool {
    if kvs.len() == 1 {
        return true;
    }
    let cp = kv::common_prefix(kvs).bits();
    if kvs.len() <= COMPRESSED_TERM_CAP
        && kvs
            .iter()
            .all(|kv| kv.key.bits() - cp <= COMPRESSED_SUFFIX_BITS)
    {
        return true;
    }
    kvs.len() <= SPARSE_TERM_CAP
}

fn make_terminal(ctx: &Ctx, gc: &mut GcList, kvs: &[Kv], state: State) -> OpResult<TriePtr> {
    debug_assert!(!kv::has_ptr(kvs));

    if kvs.len() == 1 {
        let kv = &kvs[0];
        if let Some(data) = layout::pack_inline(&kv.key, kv.value) {
            return Ok(TriePtr::new(NodeType::InlineTerm, state, data));
        }
        let ty = if kv.key.bits() <= 64 {
            NodeType::BasicKeyedTerm
        } else {
            NodeType::LargeKeyTerm
        };
        let repr = KeyedTermRepr {
            key: kv.key.alloc_repr(ctx.pin, ctx.arena)?,
            value: kv.value,
        };
        return layout::alloc(ctx, gc, ty, state, &repr);
    }

    let cp_frag = kv::common_prefix(kvs);
    let cp = cp_frag.bits();
    if kvs.len() <= COMPRESSED_TERM_CAP
        && kvs
            .iter()
            .all(|kv| kv.key.bits() - cp <= COMPRESSED_SUFFIX_BITS)
    {
        let mut repr = CompressedTermRepr {
            prefix: cp_frag.alloc_repr(ctx.pin, ctx.arena)?,
            count: kvs.len() as u64,
            suffix_len: [0; COMPRESSED_TERM_CAP],
            suffixes: [0; COMPRESSED_TERM_CAP],
            values: [0; COMPRESSED_TERM_CAP],
        };
        for (i, kv) in kvs.iter().enumerate() {
            let len = kv.key.bits() - cp;
            repr.suffix_len[i] = len as u8;
            repr.suffixes[i] = kv.key.get_bits(len, cp) as u16;
            repr.values[i] = kv.value;
        }
        return layout::alloc(ctx, gc, NodeType::CompressedTerm, state, &repr);
    }

    assert!(kvs.len() <= SPARSE_TERM_CAP, "terminal node overflow");
    let mut repr = SparseTermRepr {
        count: kvs.len() as u64,
        keys: [crate::frag::KeyFragmentRepr::invalid(); SPARSE_TERM_CAP],
        values: [0; SPARSE_TERM_CAP],
    };
    for (i, kv) in kvs.iter().enumerate() {
        repr.keys[i] = kv.key.alloc_repr(ctx.pin, ctx.arena)?;
        repr.values[i] = kv.value;
    }
    layout::alloc(ctx, gc, NodeType::SparseTerm, state, &repr)
}

fn make_branching(ctx: &Ctx, gc: &mut GcList, kvs: &[Kv], state: State) -> OpResult<TriePtr> {
    // A pointer entry sitting exactly at the common prefix means a whole
    // subtree must merge with its siblings: flatten it one level and retry.
    let cp_frag = kv::common_prefix(kvs);
    let cp = cp_frag.bits();
    if let Some(pos) = kvs
        .iter()
        .position(|kv| kv.is_ptr && kv.key.bits() == cp)
    {
        let child = kvs[pos].get_ptr();
        let mut expanded: Vec<Kv> = Vec::with_capacity(kvs.len() + 4);
        expanded.extend_from_slice(&kvs[..pos]);
        for inner in kv::prefix_keys(&ops::gather_kv(ctx, child), &kvs[pos].key) {
            kv::insert_kv(&mut expanded, inner);
        }
        expanded.extend_from_slice(&kvs[pos + 1..]);
        ops::retire(ctx, gc, child);
        return build(ctx, gc, &expanded, state);
    }

    // Value ending exactly at the branch point goes in the node itself.
    let mut value_at_prefix = None;
    let mut rest: Vec<&Kv> = Vec::with_capacity(kvs.len());
    for kv in kvs {
        if !kv.is_ptr && kv.key.bits() == cp {
            value_at_prefix = Some(kv.value);
        } else {
            rest.push(kv);
        }
    }
    debug_assert!(!rest.is_empty());

    let can_wide = rest.iter().all(|kv| kv.key.bits() - cp >= BRANCH_BITS);
    let nbits = if can_wide {
        let mut chunks: Vec<u64> = rest
            .iter()
            .map(|kv| kv.key.get_bits(BRANCH_BITS, cp))
            .collect();
        chunks.sort_unstable();
        chunks.dedup();
        if chunks.len() >= 5 {
            BRANCH_BITS
        } else {
            1
        }
    } else {
        1
    };

    // Group by the next `nbits` bits and build each child over its trimmed
    // entries; a group holding a single subtree pointer is adopted whole.
    let mut children: Vec<(u64, TriePtr)> = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        let chunk = rest[i].key.get_bits(nbits, cp);
        let mut j = i;
        while j < rest.len() && rest[j].key.get_bits(nbits, cp) == chunk {
            j += 1;
        }
        let group: Vec<Kv> = rest[i..j]
            .iter()
            .map(|kv| Kv {
                key: kv.key.suffix(cp + nbits),
                value: kv.value,
                is_ptr: kv.is_ptr,
            })
            .collect();
        let child = build(ctx, gc, &group, state)?;
        children.push((chunk, child));
        i = j;
    }

    let has_value = value_at_prefix.is_some();
    let value = value_at_prefix.unwrap_or(0);

    if nbits == 1 {
        let mut slots = [0u64; 2];
        for (chunk, child) in &children {
            slots[*chunk as usize] = child.bits();
        }
        let repr = BinaryBranchRepr {
            prefix: cp_frag.alloc_repr(ctx.pin, ctx.arena)?,
            children: slots,
            has_value: has_value as u64,
            value,
        };
        return layout::alloc(ctx, gc, NodeType::BinaryBranch, state, &repr);
    }

    if children.len() >= 10 {
        let mut slots = [0u64; layout::BRANCH_FANOUT];
        for (chunk, child) in &children {
            slots[*chunk as usize] = child.bits();
        }
        let repr = DenseBranchRepr {
            prefix: cp_frag.alloc_repr(ctx.pin, ctx.arena)?,
            nbits: nbits as u64,
            has_value: has_value as u64,
            value,
            children: slots,
        };
        return layout::alloc(ctx, gc, NodeType::DenseBranch, state, &repr);
    }

    let mut repr = SparseBranchRepr {
        prefix: cp_frag.alloc_repr(ctx.pin, ctx.arena)?,
        count: children.len() as u64,
        has_value: has_value as u64,
        value,
        chunks: [0; layout::BRANCH_FANOUT],
        children: [0; layout::BRANCH_FANOUT],
    };
    for (i, (chunk, child)) in children.iter().enumerate() {
        repr.chunks[i] = *chunk as u8;
        repr.children[i] = child.bits();
    }
    layout::alloc(ctx, gc, NodeType::SparseBranch, state, &repr)
}
