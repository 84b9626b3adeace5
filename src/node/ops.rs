//! The uniform node operation set.
//!
//! Each primitive dispatches on the pointer's type tag; structural edits
//! additionally dispatch on the state bit. Copy variants leave the original
//! untouched and register replacements with the [`GcList`]; in-place
//! variants mutate nodes private to a transaction and free what they
//! replace immediately.
//!
//! Structural edits are expressed as gather-modify-rebuild through the node
//! builder: the same code path that bursts oversized terminals, which keeps
//! the node-kind choice a pure function of the entry list and the shape
//! invariants true by construction.

use super::build::build;
use super::layout::{self, Branch};
use super::{Ctx, GcList, NodeType, State, TriePtr};
use crate::error::OpResult;
use crate::frag::KeyFragment;
use crate::kv::{self, Kv, KvList};
use crate::path::TriePathEntry;

/// Count of values reachable under `ptr`.
pub fn size(ctx: &Ctx, ptr: TriePtr) -> u64 {
    match ptr.node_type() {
        NodeType::NullTerm => 0,
        NodeType::InlineTerm | NodeType::BasicKeyedTerm | NodeType::LargeKeyTerm => 1,
        NodeType::SparseTerm | NodeType::CompressedTerm => {
            layout::load_terminal(ctx, ptr).entries.len() as u64
        }
        NodeType::BinaryBranch | NodeType::DenseBranch | NodeType::SparseBranch => {
            let b = layout::load_branch(ctx, ptr);
            let mut total = b.has_value as u64;
            for (_, child) in &b.children {
                total += size(ctx, *child);
            }
            total
        }
    }
}

/// Sorted list of the node's immediate entries: terminal values, or the
/// node value plus one pointer per child edge.
pub fn gather_kv(ctx: &Ctx, ptr: TriePtr) -> KvList {
    match ptr.node_type() {
        NodeType::NullTerm => Vec::new(),
        NodeType::InlineTerm
        | NodeType::BasicKeyedTerm
        | NodeType::LargeKeyTerm
        | NodeType::SparseTerm
        | NodeType::CompressedTerm => layout::load_terminal(ctx, ptr)
            .entries
            .into_iter()
            .map(|(key, value)| Kv::value(key, value))
            .collect(),
        NodeType::BinaryBranch | NodeType::DenseBranch | NodeType::SparseBranch => {
            let b = layout::load_branch(ctx, ptr);
            let mut out = Vec::with_capacity(b.children.len() + 1);
            if b.has_value {
                out.push(Kv::value(b.prefix.clone(), b.value));
            }
            for (chunk, child) in &b.children {
                out.push(Kv::child(b.edge(*chunk), *child));
            }
            out
        }
    }
}

pub fn is_branching(ptr: TriePtr) -> bool {
    ptr.is_branching()
}

/// Consume as much of `key` as this node covers.
pub fn match_key(ctx: &Ctx, ptr: TriePtr, key: &KeyFragment) -> TriePathEntry {
    match ptr.node_type() {
        NodeType::NullTerm => TriePathEntry::off_the_end(0),
        NodeType::InlineTerm
        | NodeType::BasicKeyedTerm
        | NodeType::LargeKeyTerm
        | NodeType::SparseTerm
        | NodeType::CompressedTerm => {
            let term = layout::load_terminal(ctx, ptr);
            let mut skipped = 0;
            for (i, (entry_key, value)) in term.entries.iter().enumerate() {
                if entry_key == key {
                    return TriePathEntry::terminal(key.bits(), *value, i as u64);
                }
                if entry_key < key {
                    skipped += 1;
                }
            }
            TriePathEntry::off_the_end(skipped)
        }
        NodeType::BinaryBranch | NodeType::DenseBranch | NodeType::SparseBranch => {
            let b = layout::load_branch(ctx, ptr);
            match_key_branch(ctx, ptr, &b, key)
        }
    }
}

fn match_key_branch(ctx: &Ctx, ptr: TriePtr, b: &Branch, key: &KeyFragment) -> TriePathEntry {
    let cp = key.common_prefix_len(&b.prefix);
    if cp < b.prefix.bits() {
        // Diverged inside the prefix: the key is either before everything
        // under this node or after everything.
        let rank = if cp == key.bits() || key.get_bits(1, cp) == 0 {
            0
        } else {
            size(ctx, ptr)
        };
        return TriePathEntry::off_the_end(rank);
    }

    let rest = key.bits() - b.prefix.bits();
    if rest == 0 {
        return if b.has_value {
            TriePathEntry::terminal(b.prefix.bits(), b.value, 0)
        } else {
            TriePathEntry::off_the_end(0)
        };
    }

    if rest < b.nbits {
        // The key ends inside the branch chunk; rank it against the
        // children's leading bits.
        let part = key.get_bits(rest, b.prefix.bits());
        let mut rank = b.has_value as u64;
        for (chunk, child) in &b.children {
            if (chunk >> (b.nbits - rest)) < part {
                rank += size(ctx, *child);
            }
        }
        return TriePathEntry::off_the_end(rank);
    }

    let chunk = key.get_bits(b.nbits, b.prefix.bits());
    let mut rank = b.has_value as u64;
    for (c, child) in &b.children {
        if *c < chunk {
            rank += size(ctx, *child);
        } else if *c == chunk {
            return TriePathEntry::non_terminal(b.prefix.bits() + b.nbits, *child, rank);
        } else {
            break;
        }
    }
    TriePathEntry::off_the_end(rank)
}

/// Locate the i-th value by in-order rank within this node.
pub fn match_index(ctx: &Ctx, ptr: TriePtr, index: u64) -> TriePathEntry {
    match ptr.node_type() {
        NodeType::NullTerm => panic!("match_index on an empty subtree"),
        NodeType::InlineTerm
        | NodeType::BasicKeyedTerm
        | NodeType::LargeKeyTerm
        | NodeType::SparseTerm
        | NodeType::CompressedTerm => {
            let term = layout::load_terminal(ctx, ptr);
            let (key, value) = term
                .entries
                .get(index as usize)
                .expect("match_index past the end of a terminal node");
            TriePathEntry::terminal(key.bits(), *value, index)
        }
        NodeType::BinaryBranch | NodeType::DenseBranch | NodeType::SparseBranch => {
            let b = layout::load_branch(ctx, ptr);
            if b.has_value && index == 0 {
                return TriePathEntry::terminal(b.prefix.bits(), b.value, 0);
            }
            let mut start = b.has_value as u64;
            for (_, child) in &b.children {
                let sz = size(ctx, *child);
                if index < start + sz {
                    return TriePathEntry::non_terminal(b.prefix.bits() + b.nbits, *child, start);
                }
                start += sz;
            }
            panic!("match_index past the end of a branching node");
        }
    }
}

/// The key fragment this node contributes for the entry containing rank
/// `index`.
pub fn extract_key(ctx: &Ctx, ptr: TriePtr, index: u64) -> KeyFragment {
    match ptr.node_type() {
        NodeType::NullTerm => panic!("extract_key on an empty subtree"),
        NodeType::InlineTerm
        | NodeType::BasicKeyedTerm
        | NodeType::LargeKeyTerm
        | NodeType::SparseTerm
        | NodeType::CompressedTerm => {
            let term = layout::load_terminal(ctx, ptr);
            term.entries[index as usize].0.clone()
        }
        NodeType::BinaryBranch | NodeType::DenseBranch | NodeType::SparseBranch => {
            let b = layout::load_branch(ctx, ptr);
            if b.has_value && index == 0 {
                return b.prefix.clone();
            }
            let mut start = b.has_value as u64;
            for (chunk, child) in &b.children {
                let sz = size(ctx, *child);
                if index < start + sz {
                    return b.edge(*chunk);
                }
                start += sz;
            }
            panic!("extract_key past the end of a branching node");
        }
    }
}

/// First entry of the node, or off-the-end when it is empty.
pub fn first(ctx: &Ctx, ptr: TriePtr) -> TriePathEntry {
    if ptr.is_null() {
        return TriePathEntry::off_the_end(0);
    }
    match_index(ctx, ptr, 0)
}

pub fn off_the_end(ctx: &Ctx, ptr: TriePtr) -> TriePathEntry {
    TriePathEntry::off_the_end(size(ctx, ptr))
}

/*****************************************************************************/
/* STRUCTURAL EDITS                                                          */
/*****************************************************************************/

/// Retire the original of a rebuild: private in-place nodes die now (and
/// leave the provisional ledger), published copy-on-write nodes are logged
/// for deferred reclamation after the operation publishes.
pub(super) fn retire(ctx: &Ctx, gc: &mut GcList, ptr: TriePtr) {
    match ptr.state() {
        State::InPlace => {
            gc.forget_new(ptr);
            dealloc_node(ctx, ptr);
        }
        State::CopyOnWrite => gc.add_old(ptr),
    }
}

/// Return a subtree equal to `ptr` with `(key, value)` inserted. The key
/// must not already be present.
pub fn insert_leaf(
    ctx: &Ctx,
    gc: &mut GcList,
    ptr: TriePtr,
    key: &KeyFragment,
    value: u64,
    state: State,
) -> OpResult<TriePtr> {
    let mut kvs = gather_kv(ctx, ptr);
    debug_assert!(
        kvs.iter().all(|kv| kv.is_ptr || &kv.key != key),
        "insert_leaf of a key already present"
    );
    kv::insert_kv(&mut kvs, Kv::value(key.clone(), value));
    let rebuilt = build(ctx, gc, &kvs, state)?;
    retire(ctx, gc, ptr);
    Ok(rebuilt)
}

/// Return a subtree equal to `ptr` with `key` removed; collapses through
/// the builder when the removal leaves a trivial shape.
pub fn remove_leaf(
    ctx: &Ctx,
    gc: &mut GcList,
    ptr: TriePtr,
    key: &KeyFragment,
    state: State,
) -> OpResult<TriePtr> {
    let mut kvs = gather_kv(ctx, ptr);
    let before = kvs.len();
    kvs.retain(|kv| kv.is_ptr || &kv.key != key);
    debug_assert_eq!(before, kvs.len() + 1, "remove_leaf of an absent key");
    let rebuilt = build(ctx, gc, &kvs, state)?;
    retire(ctx, gc, ptr);
    Ok(rebuilt)
}

/// Replace the value stored at `key` within this node.
pub fn replace_value(
    ctx: &Ctx,
    gc: &mut GcList,
    ptr: TriePtr,
    key: &KeyFragment,
    value: u64,
    state: State,
) -> OpResult<TriePtr> {
    if ptr.state() == State::InPlace && layout::set_value_in_place(ctx, ptr, key, value) {
        return Ok(ptr);
    }
    let mut kvs = gather_kv(ctx, ptr);
    let mut hit = false;
    for kv in kvs.iter_mut() {
        if !kv.is_ptr && &kv.key == key {
            kv.value = value;
            hit = true;
            break;
        }
    }
    assert!(hit, "replace_value of an absent key");
    let rebuilt = build(ctx, gc, &kvs, state)?;
    retire(ctx, gc, ptr);
    Ok(rebuilt)
}

/// Swap the child subtree `old_child` for `new_child`, keeping the node's
/// shape. A null `new_child` removes the edge and re-simplifies instead.
pub fn replace_child(
    ctx: &Ctx,
    gc: &mut GcList,
    ptr: TriePtr,
    old_child: TriePtr,
    new_child: TriePtr,
    state: State,
) -> OpResult<TriePtr> {
    debug_assert!(ptr.is_branching());
    let b = layout::load_branch(ctx, ptr);
    let chunk = b
        .children
        .iter()
        .find(|(_, c)| *c == old_child)
        .map(|(chunk, _)| *chunk)
        .expect("replace_child: old child not present");

    if new_child.is_null() {
        // The edge disappears; rebuild so I1 keeps holding.
        let mut kvs = gather_kv(ctx, ptr);
        kvs.retain(|kv| !(kv.is_ptr && kv.get_ptr() == old_child));
        let rebuilt = build(ctx, gc, &kvs, state)?;
        retire(ctx, gc, ptr);
        return Ok(rebuilt);
    }

    if ptr.state() == State::InPlace {
        layout::set_child_in_place(ctx, ptr, chunk, new_child);
        return Ok(ptr);
    }
    let copy = layout::clone_node(ctx, gc, ptr, state)?;
    layout::set_child_in_place(ctx, copy, chunk, new_child);
    gc.add_old(ptr);
    Ok(copy)
}

/// On a branching node, set the child under `edge` (node-relative key):
/// insert, replace, or remove as `child` is non-null or null.
pub fn set_branch(
    ctx: &Ctx,
    gc: &mut GcList,
    ptr: TriePtr,
    edge: &KeyFragment,
    child: TriePtr,
    state: State,
) -> OpResult<TriePtr> {
    let mut kvs = gather_kv(ctx, ptr);
    kvs.retain(|kv| !(kv.is_ptr && kv.key == *edge));
    if !child.is_null() {
        kv::insert_kv(&mut kvs, Kv::child(edge.clone(), child));
    }
    let rebuilt = build(ctx, gc, &kvs, state)?;
    retire(ctx, gc, ptr);
    Ok(rebuilt)
}

/// Prepend `prefix` to every key in the subtree. Branch nodes absorb the
/// bits into their stored prefix; terminals rebuild.
pub fn prefix_keys(
    ctx: &Ctx,
    gc: &mut GcList,
    ptr: TriePtr,
    prefix: &KeyFragment,
    state: State,
) -> OpResult<TriePtr> {
    if prefix.is_empty() {
        return Ok(ptr);
    }
    if ptr.is_null() {
        return Ok(ptr);
    }
    if ptr.state() == State::InPlace {
        if ptr.is_branching() {
            prefix_in_place(ctx, ptr, prefix)?;
            return Ok(ptr);
        }
        let kvs = kv::prefix_keys(&gather_kv(ctx, ptr), prefix);
        let rebuilt = build(ctx, gc, &kvs, state)?;
        gc.forget_new(ptr);
        dealloc_node(ctx, ptr);
        return Ok(rebuilt);
    }
    let rebuilt = copy_and_prefix_keys(ctx, gc, ptr, prefix, state)?;
    gc.add_old(ptr);
    Ok(rebuilt)
}

/// Like [`prefix_keys`] but always produces a copy and never retires the
/// original; the merge tracks both trees itself.
pub fn copy_and_prefix_keys(
    ctx: &Ctx,
    gc: &mut GcList,
    ptr: TriePtr,
    prefix: &KeyFragment,
    state: State,
) -> OpResult<TriePtr> {
    if prefix.is_empty() || ptr.is_null() {
        return Ok(ptr);
    }
    if ptr.is_branching() {
        let copy = layout::clone_node(ctx, gc, ptr, state)?;
        prefix_in_place(ctx, copy, prefix)?;
        return Ok(copy);
    }
    let kvs = kv::prefix_keys(&gather_kv(ctx, ptr), prefix);
    build(ctx, gc, &kvs, state)
}

fn prefix_in_place(ctx: &Ctx, ptr: TriePtr, prefix: &KeyFragment) -> OpResult<()> {
    // Branch prefixes are a plain repr field; swap it for the longer one.
    let b = layout::load_branch(ctx, ptr);
    let extended = prefix.concat(&b.prefix);
    let new_repr = extended.alloc_repr(ctx.pin, ctx.arena)?;
    match ptr.node_type() {
        NodeType::BinaryBranch => {
            let mut repr: layout::BinaryBranchRepr = layout::load(ctx, ptr);
            KeyFragment::dealloc_repr(&repr.prefix, ctx.pin, ctx.arena);
            repr.prefix = new_repr;
            layout::store(ctx, ptr, &repr);
        }
        NodeType::DenseBranch => {
            let mut repr: layout::DenseBranchRepr = layout::load(ctx, ptr);
            KeyFragment::dealloc_repr(&repr.prefix, ctx.pin, ctx.arena);
            repr.prefix = new_repr;
            layout::store(ctx, ptr, &repr);
        }
        NodeType::SparseBranch => {
            let mut repr: layout::SparseBranchRepr = layout::load(ctx, ptr);
            KeyFragment::dealloc_repr(&repr.prefix, ctx.pin, ctx.arena);
            repr.prefix = new_repr;
            layout::store(ctx, ptr, &repr);
        }
        t => panic!("prefix_in_place on non-branching node {t:?}"),
    }
    Ok(())
}

/*****************************************************************************/
/* STATE CHANGES                                                             */
/*****************************************************************************/

/// Convert copy-on-write to in-place (a private copy) or back.
pub fn change_state(
    ctx: &Ctx,
    gc: &mut GcList,
    ptr: TriePtr,
    new_state: State,
) -> OpResult<TriePtr> {
    if ptr.is_null() || ptr.state() == new_state {
        return Ok(ptr);
    }
    match new_state {
        State::InPlace => layout::clone_node(ctx, gc, ptr, State::InPlace),
        State::CopyOnWrite => Ok(convert_to_cow(ctx, ptr, &mut |_| {}, &mut |_| {})),
    }
}

/// Walk the in-place subgraph reachable from `ptr`, rewriting child
/// pointers so every descendant is copy-on-write again. `on_ip` sees each
/// converted in-place node (the commit's survivors); `on_shared` sees each
/// copy-on-write subtree the walk stopped at.
pub fn convert_to_cow(
    ctx: &Ctx,
    ptr: TriePtr,
    on_ip: &mut dyn FnMut(TriePtr),
    on_shared: &mut dyn FnMut(TriePtr),
) -> TriePtr {
    if ptr.is_null() {
        return ptr;
    }
    if ptr.state() == State::CopyOnWrite {
        on_shared(ptr);
        return ptr;
    }
    if ptr.is_branching() {
        let b = layout::load_branch(ctx, ptr);
        for (chunk, child) in &b.children {
            let converted = convert_to_cow(ctx, *child, on_ip, on_shared);
            if converted != *child {
                layout::set_child_in_place(ctx, ptr, *chunk, converted);
            }
        }
    }
    on_ip(ptr);
    ptr.with_state(State::CopyOnWrite)
}

/*****************************************************************************/
/* DEALLOCATION                                                              */
/*****************************************************************************/

/// Free one node and its owned fragments; children are untouched.
pub fn dealloc_node(ctx: &Ctx, ptr: TriePtr) {
    layout::dealloc_node(ctx, ptr);
}

/// Free a whole subtree.
pub fn dealloc_recursive(ctx: &Ctx, ptr: TriePtr) {
    if ptr.is_null() {
        return;
    }
    if ptr.is_branching() {
        let b = layout::load_branch(ctx, ptr);
        for (_, child) in &b.children {
            dealloc_recursive(ctx, *child);
        }
    }
    layout::dealloc_node(ctx, ptr);
}

/*****************************************************************************/
/* DIAGNOSTICS                                                               */
/*****************************************************************************/

/// Accumulate structural statistics for the subtree at `ptr`.
pub fn stats(ctx: &Ctx, ptr: TriePtr, out: &mut crate::stats::TrieStats, depth: u64) {
    if ptr.is_null() {
        return;
    }
    out.nodes_by_kind[ptr.node_type() as usize] += 1;
    out.total_nodes += 1;
    out.max_depth = out.max_depth.max(depth);
    if ptr.is_allocated() {
        out.node_bytes += ctx.arena.size_of(ctx.pin, ptr.offset()) + 8;
    }
    if ptr.is_branching() {
        let b = layout::load_branch(ctx, ptr);
        if b.prefix.bits() > 64 {
            out.external_key_bytes += (b.prefix.bits() as u64 + 7) / 8 + 2;
        }
        out.values += b.has_value as u64;
        for (_, child) in &b.children {
            stats(ctx, *child, out, depth + 1);
        }
    } else {
        for (key, _) in layout::load_terminal(ctx, ptr).entries {
            out.values += 1;
            if key.bits() > 64 {
                out.external_key_bytes += (key.bits() as u64 + 7) / 8 + 2;
            }
        }
    }
}

/// Write an indented textual rendering of the subtree, for debugging.
pub fn dump(ctx: &Ctx, ptr: TriePtr, indent: usize, out: &mut String) {
    use std::fmt::Write;
    let pad = "  ".repeat(indent);
    if ptr.is_null() {
        let _ = writeln!(out, "{pad}<null>");
        return;
    }
    if ptr.is_branching() {
        let b = layout::load_branch(ctx, ptr);
        let _ = writeln!(
            out,
            "{pad}{:?} prefix={:?} value={}",
            ptr,
            b.prefix,
            if b.has_value {
                b.value.to_string()
            } else {
                "-".into()
            }
        );
        for (chunk, child) in &b.children {
            let _ = writeln!(out, "{pad}  [{chunk:x}]");
            dump(ctx, *child, indent + 2, out);
        }
    } else {
        let _ = writeln!(out, "{pad}{ptr:?}");
        for (key, value) in layout::load_terminal(ctx, ptr).entries {
            let _ = writeln!(out, "{pad}  {key:?} = {value}");
        }
    }
}

/// Apply `f` to every (full key, value) pair under `ptr` in key order.
pub fn for_each_value(
    ctx: &Ctx,
    ptr: TriePtr,
    prefix: &KeyFragment,
    f: &mut dyn FnMut(KeyFragment, u64),
) {
    if ptr.is_null() {
        return;
    }
    for kv in gather_kv(ctx, ptr) {
        let key = prefix.concat(&kv.key);
        if kv.is_ptr {
            for_each_value(ctx, kv.get_ptr(), &key, f);
        } else {
            f(key, kv.value);
        }
    }
}
