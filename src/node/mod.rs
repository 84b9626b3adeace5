//! Trie node taxonomy.
//!
//! Nodes are identified by a [`TriePtr`]: a 64-bit composite of a 6-bit
//! type tag, a 1-bit copy-on-write/in-place state, and 57 bits of data
//! (an inlined payload or a region offset). The node set is closed and
//! dictated by the on-file type tag; every primitive dispatches on it.

mod build;
mod layout;
mod ops;

pub use build::build;
pub use ops::*;

use std::fmt;

use crate::arena::Arena;
use crate::region::Pin;

/// Node type tags. Changing these values breaks binary compatibility.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum NodeType {
    NullTerm = 0,
    BinaryBranch = 1,
    InlineTerm = 2,
    BasicKeyedTerm = 3,
    SparseTerm = 4,
    CompressedTerm = 5,
    LargeKeyTerm = 6,
    DenseBranch = 7,
    SparseBranch = 8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    CopyOnWrite,
    InPlace,
}

const TYPE_BITS: u32 = 6;
const STATE_BITS: u32 = 1;
const META_BITS: u32 = TYPE_BITS + STATE_BITS;
pub const DATA_BITS: u32 = 64 - META_BITS;

const TYPE_MASK: u64 = (1 << TYPE_BITS) - 1;
const STATE_MASK: u64 = 1 << TYPE_BITS;

/// Pointer to a node of a memory-mapped trie. Mostly opaque; the type tag
/// selects the decoding, the state bit selects copy versus in-place
/// operation variants. A null pointer is the empty subtree.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriePtr(u64);

impl TriePtr {
    pub fn null() -> TriePtr {
        TriePtr(0)
    }

    pub fn new(ty: NodeType, state: State, data: u64) -> TriePtr {
        debug_assert!(data < (1 << DATA_BITS), "trie ptr data overflow");
        let state_bit = match state {
            State::CopyOnWrite => 0,
            State::InPlace => STATE_MASK,
        };
        TriePtr(ty as u64 | state_bit | (data << META_BITS))
    }

    /// The only way to revive a pointer from its raw bit pattern.
    pub fn from_bits(bits: u64) -> TriePtr {
        TriePtr(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn node_type(self) -> NodeType {
        match self.0 & TYPE_MASK {
            0 => NodeType::NullTerm,
            1 => NodeType::BinaryBranch,
            2 => NodeType::InlineTerm,
            3 => NodeType::BasicKeyedTerm,
            4 => NodeType::SparseTerm,
            5 => NodeType::CompressedTerm,
            6 => NodeType::LargeKeyTerm,
            7 => NodeType::DenseBranch,
            8 => NodeType::SparseBranch,
            t => panic!("attempt to dereference invalid trie ptr type {t}"),
        }
    }

    pub fn state(self) -> State {
        if self.0 & STATE_MASK != 0 {
            State::InPlace
        } else {
            State::CopyOnWrite
        }
    }

    pub fn with_state(self, state: State) -> TriePtr {
        match state {
            State::CopyOnWrite => TriePtr(self.0 & !STATE_MASK),
            State::InPlace => TriePtr(self.0 | STATE_MASK),
        }
    }

    pub fn data(self) -> u64 {
        self.0 >> META_BITS
    }

    /// Region offset of an allocated node.
    pub fn offset(self) -> u64 {
        debug_assert!(self.is_allocated());
        self.data()
    }

    pub fn is_null(self) -> bool {
        self.node_type() == NodeType::NullTerm
    }

    /// Whether the node owns a region allocation (as opposed to living
    /// entirely inside the pointer).
    pub fn is_allocated(self) -> bool {
        !matches!(self.node_type(), NodeType::NullTerm | NodeType::InlineTerm)
    }

    pub fn is_branching(self) -> bool {
        matches!(
            self.node_type(),
            NodeType::BinaryBranch | NodeType::DenseBranch | NodeType::SparseBranch
        )
    }
}

impl fmt::Debug for TriePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "<null>");
        }
        let state = match self.state() {
            State::CopyOnWrite => "cow",
            State::InPlace => "ip",
        };
        write!(f, "<{:?}:{}:{:#x}>", self.node_type(), state, self.data())
    }
}

impl Default for TriePtr {
    fn default() -> Self {
        TriePtr::null()
    }
}

/// Everything a node primitive needs: a pinned region and the allocator.
pub struct Ctx<'a, 'r> {
    pub pin: &'a Pin<'r>,
    pub arena: &'a Arena,
}

impl<'a, 'r> Ctx<'a, 'r> {
    pub fn new(pin: &'a Pin<'r>, arena: &'a Arena) -> Self {
        Ctx { pin, arena }
    }
}

/// Ledger of nodes created and replaced by one operation.
///
/// New nodes are provisional until the operation publishes: on failure they
/// are deallocated synchronously, on success the replaced nodes are handed
/// to the epoch manager instead.
#[derive(Default)]
pub struct GcList {
    new_nodes: Vec<TriePtr>,
    old_nodes: Vec<TriePtr>,
}

impl GcList {
    pub fn new() -> GcList {
        GcList::default()
    }

    pub fn add_new(&mut self, ptr: TriePtr) {
        if ptr.is_allocated() {
            self.new_nodes.push(ptr);
        }
    }

    pub fn add_old(&mut self, ptr: TriePtr) {
        // In-place nodes are private to their transaction and deallocated
        // by hand; only published CoW nodes need a grace period.
        if ptr.is_allocated() && ptr.state() == State::CopyOnWrite {
            self.old_nodes.push(ptr);
        }
    }

    pub fn new_nodes(&self) -> &[TriePtr] {
        &self.new_nodes
    }

    /// Drop a provisional node from the ledger because it has just been
    /// deallocated by an in-place rebuild.
    pub fn forget_new(&mut self, ptr: TriePtr) {
        if let Some(i) = self.new_nodes.iter().position(|p| *p == ptr) {
            self.new_nodes.swap_remove(i);
        }
    }

    pub fn take_new(&mut self) -> Vec<TriePtr> {
        std::mem::take(&mut self.new_nodes)
    }

    pub fn take_old(&mut self) -> Vec<TriePtr> {
        std::mem::take(&mut self.old_nodes)
    }

    /// Drop every provisional node, for a failed or abandoned attempt.
    pub fn rollback(&mut self, ctx: &Ctx) {
        for ptr in std::mem::take(&mut self.new_nodes) {
            ops::dealloc_node(ctx, ptr);
        }
        self.old_nodes.clear();
    }
}
