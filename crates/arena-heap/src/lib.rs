//! Native heap manager for a single pre-registered memory arena.
//!
//! This crate manages one contiguous byte region without any help from a
//! host allocator. The region is carved into page-granular nodes; free nodes
//! are kept on a doubly linked free list and allocated with a best-fit (or
//! first-fit) search, oversized nodes are split and freed nodes are eagerly
//! coalesced with their physical neighbors.
//!
//! # Components
//!
//! ## [`Arena`]
//!
//! The heap manager itself. It owns the region and every node in it, and
//! needs `&mut self` for each operation.
//!
//! ## [`Heap`]
//!
//! An [`Arena`] behind a spin lock, for sharing between execution contexts.
//! Each entry point is one critical section.
//!
//! # Usage Example
//!
//! ```rust
//! use arena_heap::{Arena, BlockPtr};
//!
//! let mut region = vec![0u8; 4096];
//! let mut arena = Arena::new();
//! arena.init(&mut region);
//!
//! let ptr = arena.allocate(64).unwrap();
//! arena.block_mut(ptr).unwrap()[..5].copy_from_slice(b"hello");
//!
//! let ptr = arena.reallocate(ptr, 512).unwrap().unwrap();
//! assert_eq!(&arena.block(ptr).unwrap()[..5], b"hello");
//!
//! arena.free(ptr).unwrap();
//! assert!(arena.free(ptr).is_err());
//! assert!(arena.free(BlockPtr::NULL).is_err());
//! ```
//!
//! # Block Handles
//!
//! Blocks are named by [`BlockPtr`], an offset into the arena rather than a
//! machine address. Neighbor lookups are offset arithmetic checked against
//! the arena bounds, so a stray handle is reported as
//! [`HeapError::Corrupted`] instead of touching memory outside the region.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    arena::{Arena, FitPolicy, HeapStats},
    error::HeapError,
    heap::Heap,
    node::{BlockPtr, NodeInfo, NodeState},
};

mod arena;
mod error;
mod heap;
mod node;

/// log2 of the allocation granularity.
pub const PAGE_SHIFT: u32 = 5;

/// Allocation granularity. Every node size is a multiple of this.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Smallest surplus worth splitting off an allocated node.
pub const SPLIT_THRESHOLD: usize = PAGE_SIZE;

/// Distance between a node's start and the block handed to its owner.
pub const ALLOC_OFFSET: usize = 12;

/// Smallest region [`Arena::init`] accepts: two sentinels and one page.
pub const MIN_ARENA_SIZE: usize = PAGE_SIZE * 3;
