//! On-region node layouts and their decoded views.
//!
//! Every allocated node is a `#[repr(C)]` Pod struct written at its
//! pointer's offset. Reading decodes into one of two views: [`Branch`]
//! (prefix, branch width, optional value, sorted children) or [`Terminal`]
//! (sorted key/value entries). The uniform primitives in `ops` work on
//! these views; only the load/store/clone/dealloc code here knows the
//! physical shapes.

use bytemuck::{Pod, Zeroable};

use super::{Ctx, GcList, NodeType, State, TriePtr};
use crate::error::OpResult;
use crate::frag::{KeyFragment, KeyFragmentRepr};

/// Longest key held entirely inside an InlineTerm pointer.
pub const INLINE_KEY_BITS: usize = 19;
const INLINE_VALUE_BITS: u32 = 32;

/// Branch width of dense and sparse branches.
pub const BRANCH_BITS: usize = 4;
pub const BRANCH_FANOUT: usize = 1 << BRANCH_BITS;

/// Entry capacity of a sparse terminal.
pub const SPARSE_TERM_CAP: usize = 8;
/// Entry capacity of a compressed terminal.
pub const COMPRESSED_TERM_CAP: usize = 16;
/// Longest per-entry suffix a compressed terminal can hold.
pub const COMPRESSED_SUFFIX_BITS: usize = 16;

/*****************************************************************************/
/* PHYSICAL LAYOUTS                                                          */
/*****************************************************************************/

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(super) struct BinaryBranchRepr {
    pub prefix: KeyFragmentRepr,
    pub children: [u64; 2],
    pub has_value: u64,
    pub value: u64,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(super) struct DenseBranchRepr {
    pub prefix: KeyFragmentRepr,
    pub nbits: u64,
    pub has_value: u64,
    pub value: u64,
    pub children: [u64; BRANCH_FANOUT],
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(super) struct SparseBranchRepr {
    pub prefix: KeyFragmentRepr,
    pub count: u64,
    pub has_value: u64,
    pub value: u64,
    pub chunks: [u8; BRANCH_FANOUT],
    pub children: [u64; BRANCH_FANOUT],
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(super) struct KeyedTermRepr {
    pub key: KeyFragmentRepr,
    pub value: u64,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(super) struct SparseTermRepr {
    pub count: u64,
    pub keys: [KeyFragmentRepr; SPARSE_TERM_CAP],
    pub values: [u64; SPARSE_TERM_CAP],
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(super) struct CompressedTermRepr {
    pub prefix: KeyFragmentRepr,
    pub count: u64,
    pub suffix_len: [u8; COMPRESSED_TERM_CAP],
    pub suffixes: [u16; COMPRESSED_TERM_CAP],
    pub values: [u64; COMPRESSED_TERM_CAP],
}

/*****************************************************************************/
/* INLINE TERM PACKING                                                       */
/*****************************************************************************/

/// Pack a single (key, value) into 57 pointer data bits:
/// `[len:6][key:19][value:32]`.
pub(super) fn pack_inline(key: &KeyFragment, value: u64) -> Option<u64> {
    if key.bits() > INLINE_KEY_BITS || value >= (1 << INLINE_VALUE_BITS) {
        return None;
    }
    let kbits = if key.bits() == 0 {
        0
    } else {
        key.get_bits(key.bits(), 0)
    };
    Some(
        ((key.bits() as u64) << (INLINE_KEY_BITS as u32 + INLINE_VALUE_BITS))
            | (kbits << INLINE_VALUE_BITS)
            | value,
    )
}

pub(super) fn unpack_inline(data: u64) -> (KeyFragment, u64) {
    let len = (data >> (INLINE_KEY_BITS as u32 + INLINE_VALUE_BITS)) as usize;
    let kbits = (data >> INLINE_VALUE_BITS) & ((1 << INLINE_KEY_BITS) - 1);
    let value = data & ((1u64 << INLINE_VALUE_BITS) - 1);
    (KeyFragment::new(kbits, len), value)
}

/*****************************************************************************/
/* LOAD / STORE                                                              */
/*****************************************************************************/

pub(super) fn alloc<T: Pod>(
    ctx: &Ctx,
    gc: &mut GcList,
    ty: NodeType,
    state: State,
    repr: &T,
) -> OpResult<TriePtr> {
    let off = ctx.arena.allocate(ctx.pin, std::mem::size_of::<T>() as u64)?;
    ctx.pin.write(off, repr);
    let ptr = TriePtr::new(ty, state, off);
    gc.add_new(ptr);
    Ok(ptr)
}

pub(super) fn load<T: Pod>(ctx: &Ctx, ptr: TriePtr) -> T {
    ctx.pin.read(ptr.offset())
}

pub(super) fn store<T: Pod>(ctx: &Ctx, ptr: TriePtr, repr: &T) {
    ctx.pin.write(ptr.offset(), repr);
}

/*****************************************************************************/
/* DECODED VIEWS                                                             */
/*****************************************************************************/

/// A branching node, decoded. Children are sorted by chunk.
pub(super) struct Branch {
    pub prefix: KeyFragment,
    pub nbits: usize,
    pub has_value: bool,
    pub value: u64,
    pub children: Vec<(u64, TriePtr)>,
}

impl Branch {
    /// The key fragment this node contributes for a child edge.
    pub fn edge(&self, chunk: u64) -> KeyFragment {
        self.prefix.concat(&KeyFragment::new(chunk, self.nbits))
    }
}

/// A terminal node, decoded into sorted (key, value) entries.
pub(super) struct Terminal {
    pub entries: Vec<(KeyFragment, u64)>,
}

pub(super) fn load_branch(ctx: &Ctx, ptr: TriePtr) -> Branch {
    match ptr.node_type() {
        NodeType::BinaryBranch => {
            let repr: BinaryBranchRepr = load(ctx, ptr);
            let mut children = Vec::with_capacity(2);
            for (chunk, bits) in repr.children.iter().enumerate() {
                let child = TriePtr::from_bits(*bits);
                if !child.is_null() {
                    children.push((chunk as u64, child));
                }
            }
            Branch {
                prefix: KeyFragment::load_repr(&repr.prefix, ctx.pin),
                nbits: 1,
                has_value: repr.has_value != 0,
                value: repr.value,
                children,
            }
        }
        NodeType::DenseBranch => {
            let repr: DenseBranchRepr = load(ctx, ptr);
            let nbits = repr.nbits as usize;
            let mut children = Vec::new();
            for chunk in 0..(1usize << nbits) {
                let child = TriePtr::from_bits(repr.children[chunk]);
                if !child.is_null() {
                    children.push((chunk as u64, child));
                }
            }
            Branch {
                prefix: KeyFragment::load_repr(&repr.prefix, ctx.pin),
                nbits,
                has_value: repr.has_value != 0,
                value: repr.value,
                children,
            }
        }
        NodeType::SparseBranch => {
            let repr: SparseBranchRepr = load(ctx, ptr);
            let mut children = Vec::with_capacity(repr.count as usize);
            for i in 0..repr.count as usize {
                children.push((
                    repr.chunks[i] as u64,
                    TriePtr::from_bits(repr.children[i]),
                ));
            }
            Branch {
                prefix: KeyFragment::load_repr(&repr.prefix, ctx.pin),
                nbits: BRANCH_BITS,
                has_value: repr.has_value != 0,
                value: repr.value,
                children,
            }
        }
        t => panic!("load_branch on non-branching node {t:?}"),
    }
}

pub(super) fn load_terminal(ctx: &Ctx, ptr: TriePtr) -> Terminal {
    match ptr.node_type() {
        NodeType::InlineTerm => {
            let (key, value) = unpack_inline(ptr.data());
            Terminal {
                entries: vec![(key, value)],
            }
        }
        NodeType::BasicKeyedTerm | NodeType::LargeKeyTerm => {
            let repr: KeyedTermRepr = load(ctx, ptr);
            Terminal {
                entries: vec![(KeyFragment::load_repr(&repr.key, ctx.pin), repr.value)],
            }
        }
        NodeType::SparseTerm => {
            let repr: SparseTermRepr = load(ctx, ptr);
            let entries = (0..repr.count as usize)
                .map(|i| {
                    (
                        KeyFragment::load_repr(&repr.keys[i], ctx.pin),
                        repr.values[i],
                    )
                })
                .collect();
            Terminal { entries }
        }
        NodeType::CompressedTerm => {
            let repr: CompressedTermRepr = load(ctx, ptr);
            let prefix = KeyFragment::load_repr(&repr.prefix, ctx.pin);
            let entries = (0..repr.count as usize)
                .map(|i| {
                    let suffix =
                        KeyFragment::new(repr.suffixes[i] as u64, repr.suffix_len[i] as usize);
                    (prefix.concat(&suffix), repr.values[i])
                })
                .collect();
            Terminal { entries }
        }
        t => panic!("load_terminal on branching node {t:?}"),
    }
}

/*****************************************************************************/
/* IN-PLACE SLOTS                                                            */
/*****************************************************************************/

/// Overwrite the child slot for `chunk`. The chunk must already be present.
pub(super) fn set_child_in_place(ctx: &Ctx, ptr: TriePtr, chunk: u64, child: TriePtr) {
    match ptr.node_type() {
        NodeType::BinaryBranch => {
            let mut repr: BinaryBranchRepr = load(ctx, ptr);
            repr.children[chunk as usize] = child.bits();
            store(ctx, ptr, &repr);
        }
        NodeType::DenseBranch => {
            let mut repr: DenseBranchRepr = load(ctx, ptr);
            repr.children[chunk as usize] = child.bits();
            store(ctx, ptr, &repr);
        }
        NodeType::SparseBranch => {
            let mut repr: SparseBranchRepr = load(ctx, ptr);
            let i = (0..repr.count as usize)
                .find(|i| repr.chunks[*i] as u64 == chunk)
                .expect("sparse branch chunk not present");
            repr.children[i] = child.bits();
            store(ctx, ptr, &repr);
        }
        t => panic!("set_child_in_place on non-branching node {t:?}"),
    }
}

/// Overwrite the value of the entry whose key equals `key` exactly.
/// Returns false when the layout cannot take the value (inline width).
pub(super) fn set_value_in_place(ctx: &Ctx, ptr: TriePtr, key: &KeyFragment, value: u64) -> bool {
    match ptr.node_type() {
        NodeType::InlineTerm => false,
        NodeType::BasicKeyedTerm | NodeType::LargeKeyTerm => {
            let mut repr: KeyedTermRepr = load(ctx, ptr);
            debug_assert_eq!(&KeyFragment::load_repr(&repr.key, ctx.pin), key);
            repr.value = value;
            store(ctx, ptr, &repr);
            true
        }
        NodeType::SparseTerm => {
            let mut repr: SparseTermRepr = load(ctx, ptr);
            for i in 0..repr.count as usize {
                if &KeyFragment::load_repr(&repr.keys[i], ctx.pin) == key {
                    repr.values[i] = value;
                    store(ctx, ptr, &repr);
                    return true;
                }
            }
            panic!("set_value_in_place: key not present");
        }
        NodeType::CompressedTerm => {
            let mut repr: CompressedTermRepr = load(ctx, ptr);
            let prefix = KeyFragment::load_repr(&repr.prefix, ctx.pin);
            for i in 0..repr.count as usize {
                let suffix =
                    KeyFragment::new(repr.suffixes[i] as u64, repr.suffix_len[i] as usize);
                if &prefix.concat(&suffix) == key {
                    repr.values[i] = value;
                    store(ctx, ptr, &repr);
                    return true;
                }
            }
            panic!("set_value_in_place: key not present");
        }
        NodeType::BinaryBranch => {
            let mut repr: BinaryBranchRepr = load(ctx, ptr);
            debug_assert!(repr.has_value != 0);
            repr.value = value;
            store(ctx, ptr, &repr);
            true
        }
        NodeType::DenseBranch => {
            let mut repr: DenseBranchRepr = load(ctx, ptr);
            debug_assert!(repr.has_value != 0);
            repr.value = value;
            store(ctx, ptr, &repr);
            true
        }
        NodeType::SparseBranch => {
            let mut repr: SparseBranchRepr = load(ctx, ptr);
            debug_assert!(repr.has_value != 0);
            repr.value = value;
            store(ctx, ptr, &repr);
            true
        }
        NodeType::NullTerm => panic!("set_value_in_place on null"),
    }
}

/*****************************************************************************/
/* CLONE / DEALLOC                                                           */
/*****************************************************************************/

/// Copy a node byte for byte, sharing its key fragment blobs.
pub(super) fn clone_node(
    ctx: &Ctx,
    gc: &mut GcList,
    ptr: TriePtr,
    state: State,
) -> OpResult<TriePtr> {
    match ptr.node_type() {
        NodeType::NullTerm => Ok(TriePtr::null()),
        NodeType::InlineTerm => Ok(ptr.with_state(state)),
        NodeType::BasicKeyedTerm | NodeType::LargeKeyTerm => {
            let mut repr: KeyedTermRepr = load(ctx, ptr);
            repr.key = KeyFragment::copy_repr(&repr.key, ctx.pin);
            alloc(ctx, gc, ptr.node_type(), state, &repr)
        }
        NodeType::SparseTerm => {
            let mut repr: SparseTermRepr = load(ctx, ptr);
            for i in 0..repr.count as usize {
                repr.keys[i] = KeyFragment::copy_repr(&repr.keys[i], ctx.pin);
            }
            alloc(ctx, gc, NodeType::SparseTerm, state, &repr)
        }
        NodeType::CompressedTerm => {
            let mut repr: CompressedTermRepr = load(ctx, ptr);
            repr.prefix = KeyFragment::copy_repr(&repr.prefix, ctx.pin);
            alloc(ctx, gc, NodeType::CompressedTerm, state, &repr)
        }
        NodeType::BinaryBranch => {
            let mut repr: BinaryBranchRepr = load(ctx, ptr);
            repr.prefix = KeyFragment::copy_repr(&repr.prefix, ctx.pin);
            alloc(ctx, gc, NodeType::BinaryBranch, state, &repr)
        }
        NodeType::DenseBranch => {
            let mut repr: DenseBranchRepr = load(ctx, ptr);
            repr.prefix = KeyFragment::copy_repr(&repr.prefix, ctx.pin);
            alloc(ctx, gc, NodeType::DenseBranch, state, &repr)
        }
        NodeType::SparseBranch => {
            let mut repr: SparseBranchRepr = load(ctx, ptr);
            repr.prefix = KeyFragment::copy_repr(&repr.prefix, ctx.pin);
            alloc(ctx, gc, NodeType::SparseBranch, state, &repr)
        }
    }
}

/// Free one node and the fragments it owns. Children are untouched.
pub(super) fn dealloc_node(ctx: &Ctx, ptr: TriePtr) {
    match ptr.node_type() {
        NodeType::NullTerm | NodeType::InlineTerm => {}
        NodeType::BasicKeyedTerm | NodeType::LargeKeyTerm => {
            let repr: KeyedTermRepr = load(ctx, ptr);
            KeyFragment::dealloc_repr(&repr.key, ctx.pin, ctx.arena);
            ctx.arena.deallocate(ctx.pin, ptr.offset());
        }
        NodeType::SparseTerm => {
            let repr: SparseTermRepr = load(ctx, ptr);
            for i in 0..repr.count as usize {
                KeyFragment::dealloc_repr(&repr.keys[i], ctx.pin, ctx.arena);
            }
            ctx.arena.deallocate(ctx.pin, ptr.offset());
        }
        NodeType::CompressedTerm => {
            let repr: CompressedTermRepr = load(ctx, ptr);
            KeyFragment::dealloc_repr(&repr.prefix, ctx.pin, ctx.arena);
            ctx.arena.deallocate(ctx.pin, ptr.offset());
        }
        NodeType::BinaryBranch => {
            let repr: BinaryBranchRepr = load(ctx, ptr);
            KeyFragment::dealloc_repr(&repr.prefix, ctx.pin, ctx.arena);
            ctx.arena.deallocate(ctx.pin, ptr.offset());
        }
        NodeType::DenseBranch => {
            let repr: DenseBranchRepr = load(ctx, ptr);
            KeyFragment::dealloc_repr(&repr.prefix, ctx.pin, ctx.arena);
            ctx.arena.deallocate(ctx.pin, ptr.offset());
        }
        NodeType::SparseBranch => {
            let repr: SparseBranchRepr = load(ctx, ptr);
            KeyFragment::dealloc_repr(&repr.prefix, ctx.pin, ctx.arena);
            ctx.arena.deallocate(ctx.pin, ptr.offset());
        }
    }
}
