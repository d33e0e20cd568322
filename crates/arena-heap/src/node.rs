//! On-arena node headers and block handles.
//!
//! Every node starts with a [`NodeHeader`]. Free nodes additionally keep their
//! free-list links ([`FreeLinks`]) right after the header, in the bytes that an
//! allocated node hands out to its owner.
//!
//! ```text
//! offset   allocated node            free node
//!    0     ┌──────────────┐          ┌──────────────┐
//!          │ mark         │          │ mark         │
//!    4     │ size         │          │ size         │
//!    8     │ prev_node    │          │ prev_node    │
//!   12     ├──────────────┤ ◄─ ptr   │ prev_free    │
//!   16     │ payload ...  │          │ next_free    │
//!          │              │          │ ...          │
//!          └──────────────┘          └──────────────┘
//! ```
//!
//! All offsets are relative to the start of the arena and stored as `u32`,
//! with [`NIL`] standing for "no node".

use dataview::Pod;
use derive_more::{Display, IsVariant};

use crate::{ALLOC_OFFSET, PAGE_SIZE};

pub(crate) const MARK_ALLOCATED: u32 = 0xaa55_1234;
pub(crate) const MARK_FREE: u32 = 0x1234_55aa;
/// Mark left on a header that was absorbed by a neighbor during coalescing.
pub(crate) const MARK_DEAD: u32 = 0;

pub(crate) const NIL: u32 = u32::MAX;

/// Header at the start of every node.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub(crate) struct NodeHeader {
    pub(crate) mark: u32,
    /// Bytes spanned by the node, header included.
    pub(crate) size: u32,
    /// Offset of the physically preceding node.
    pub(crate) prev_node: u32,
}
const _: () = assert!(size_of::<NodeHeader>() == ALLOC_OFFSET);

impl NodeHeader {
    pub(crate) fn new(mark: u32, size: usize, prev_node: Option<usize>) -> Self {
        Self {
            mark,
            size: to_raw(size),
            prev_node: encode(prev_node),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size as usize
    }

    pub(crate) fn prev_node(&self) -> Option<usize> {
        decode(self.prev_node)
    }

    pub(crate) fn state(&self) -> NodeState {
        if self.mark == MARK_FREE {
            NodeState::Free
        } else {
            NodeState::Allocated
        }
    }
}

/// Free-list links stored after the header of a free node.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub(crate) struct FreeLinks {
    pub(crate) prev_free: u32,
    pub(crate) next_free: u32,
}
const _: () = assert!(ALLOC_OFFSET + size_of::<FreeLinks>() <= PAGE_SIZE);

impl FreeLinks {
    pub(crate) const UNLINKED: Self = Self {
        prev_free: NIL,
        next_free: NIL,
    };
}

/// Arena offsets never exceed `u32::MAX`: the arena length is clamped at
/// initialization.
#[expect(clippy::cast_possible_truncation)]
pub(crate) const fn to_raw(offset: usize) -> u32 {
    offset as u32
}

pub(crate) fn encode(link: Option<usize>) -> u32 {
    link.map_or(NIL, to_raw)
}

pub(crate) fn decode(raw: u32) -> Option<usize> {
    (raw != NIL).then_some(raw as usize)
}

/// Allocation state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum NodeState {
    Allocated,
    Free,
}

/// Snapshot of one node, as reported by [`Arena::nodes`] and
/// [`Arena::free_nodes`].
///
/// [`Arena::nodes`]: crate::Arena::nodes
/// [`Arena::free_nodes`]: crate::Arena::free_nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Offset of the node header within the arena.
    pub offset: usize,
    /// Bytes spanned by the node, header included.
    pub size: usize,
    /// Offset of the physically preceding node.
    pub prev: Option<usize>,
    pub state: NodeState,
}

impl NodeInfo {
    /// Offset one past the last byte of the node.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Handle to a block handed out by an [`Arena`](crate::Arena).
///
/// A block handle is the offset of the block's payload within the arena, that
/// is the offset of its node plus [`ALLOC_OFFSET`]. [`BlockPtr::NULL`] plays
/// the role of the null pointer; it can never name a real block because
/// offset zero belongs to the head sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("{_0:#x}")]
pub struct BlockPtr(usize);

impl BlockPtr {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset)
    }

    /// Unpacks a handle stored in its 32-bit form.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw as usize)
    }

    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }

    /// Packs the handle into 32 bits, the width of every arena offset.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        to_raw(self.0)
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[must_use]
    pub const fn sub(self, bytes: usize) -> Self {
        Self(self.0.saturating_sub(bytes))
    }
}
