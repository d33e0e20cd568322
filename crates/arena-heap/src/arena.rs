//! Arena heap manager.
//!
//! An [`Arena`] carves one contiguous byte region into variably sized nodes
//! laid out back to back. Two independent linkages run over the same nodes:
//!
//! - **Physical chain**: a node's successor sits at `offset + size`, and every
//!   header records the offset of its predecessor. Used for coalescing.
//! - **Free list**: a doubly linked list threaded through the free nodes only,
//!   most recently freed first. Used for the allocation search.
//!
//! # Memory Layout
//!
//! ```text
//! 0           PAGE_SIZE                                  len - PAGE_SIZE   len
//! ┌───────────┬──────────┬──────────┬─────────┬─── ... ───┬───────────────┐
//! │ head      │ node     │ node     │ node    │           │ tail          │
//! │ sentinel  │ (alloc)  │ (free)   │ (alloc) │           │ sentinel      │
//! └───────────┴──────────┴──────────┴─────────┴─── ... ───┴───────────────┘
//! ```
//!
//! Both sentinels are permanently allocated, so coalescing and splitting never
//! look past the ends of the region.
//!
//! # Algorithm
//!
//! - **Allocation**: the request plus [`ALLOC_OFFSET`] is rounded up to
//!   [`PAGE_SIZE`]. The free list is searched according to the arena's
//!   [`FitPolicy`]. A node larger than the request by at least
//!   [`SPLIT_THRESHOLD`] is split and its tail returned to the free list.
//! - **Deallocation**: the node is merged with a free physical predecessor
//!   and/or a free physical successor, then pushed onto the free list head.
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) where n is the number of free nodes
//! - **Deallocation**: O(1)
//! - **Memory Overhead**: 12 bytes per allocated node, rounded to 32 bytes

use core::{fmt, iter};

use dataview::{DataView, Pod};
use derive_more::IsVariant;
use log::trace;
use snafu::{OptionExt as _, ensure};

use crate::{
    ALLOC_OFFSET, MIN_ARENA_SIZE, PAGE_SIZE, SPLIT_THRESHOLD,
    error::{CorruptedSnafu, HeapError, InvalidArgumentSnafu, OutOfMemorySnafu},
    node::{
        self, BlockPtr, FreeLinks, MARK_ALLOCATED, MARK_DEAD, MARK_FREE, NIL, NodeHeader,
        NodeInfo,
    },
};

/// Node headers are read and written as `u32` words.
const HEADER_ALIGN: usize = align_of::<u32>();

/// Largest region an arena manages; every offset must fit in 32 bits.
const MAX_ARENA_SIZE: usize = (u32::MAX as usize) & !(PAGE_SIZE - 1);

/// Free-list search strategy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum FitPolicy {
    /// Scan the whole free list for the smallest node that fits; an exact fit
    /// ends the scan early.
    #[default]
    BestFit,
    /// Take the first node that fits.
    FirstFit,
}

/// Arena-wide byte counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Length of the managed region, sentinels included.
    pub total: usize,
    /// Bytes currently held by free nodes.
    pub available: usize,
    /// Lowest value `available` has reached since initialization.
    pub min_available: usize,
}

/// A heap manager over a single registered memory region.
///
/// The arena is `Send` but not `Sync`; wrap it in a [`Heap`](crate::Heap) to
/// share it between execution contexts.
pub struct Arena<'a> {
    region: &'a mut [u8],
    policy: FitPolicy,
    free_list_head: u32,
    tail: usize,
    available: usize,
    min_available: usize,
}

impl fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Default for Arena<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Arena<'a> {
    /// Creates an empty best-fit [`Arena`].
    ///
    /// Every allocation fails until a region is registered with
    /// [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self::with_policy(FitPolicy::BestFit)
    }

    /// Creates an empty [`Arena`] using the given search strategy.
    #[must_use]
    pub const fn with_policy(policy: FitPolicy) -> Self {
        Self {
            region: &mut [],
            policy,
            free_list_head: NIL,
            tail: 0,
            available: 0,
            min_available: 0,
        }
    }

    /// Registers `region` as the memory managed by this arena.
    ///
    /// The start of the region is aligned up for node headers and its length
    /// rounded down to [`PAGE_SIZE`]. A region that ends up smaller than
    /// [`MIN_ARENA_SIZE`] is ignored and the arena is left unchanged.
    ///
    /// Registering a new region forgets every block of the previous one.
    pub fn init(&mut self, region: &'a mut [u8]) {
        let align_offset = region.as_ptr().align_offset(HEADER_ALIGN);
        if align_offset > region.len() {
            return;
        }
        let (_, region) = region.split_at_mut(align_offset);
        let len = region.len().min(MAX_ARENA_SIZE) & !(PAGE_SIZE - 1);
        if len < MIN_ARENA_SIZE {
            trace!("arena: ignoring {}-byte region", region.len());
            return;
        }
        let (region, _) = region.split_at_mut(len);
        self.region = region;

        let head = 0;
        let first = PAGE_SIZE;
        let tail = len - PAGE_SIZE;
        self.write(head, &NodeHeader::new(MARK_ALLOCATED, PAGE_SIZE, None));
        self.write(tail, &NodeHeader {
            mark: MARK_ALLOCATED,
            size: NIL,
            prev_node: node::to_raw(first),
        });
        self.write(first, &NodeHeader::new(MARK_FREE, tail - first, Some(head)));
        self.write(first + ALLOC_OFFSET, &FreeLinks::UNLINKED);

        self.free_list_head = node::to_raw(first);
        self.tail = tail;
        self.available = tail - first;
        self.min_available = self.available;
        trace!("arena: initialized {len} bytes, {} available", self.available);
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.region.is_empty()
    }

    #[must_use]
    pub fn policy(&self) -> FitPolicy {
        self.policy
    }

    /// Bytes available to nodes between the two sentinels.
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.tail.saturating_sub(PAGE_SIZE)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total: self.region.len(),
            available: self.available,
            min_available: self.min_available,
        }
    }

    /// Allocates a block with room for at least `size` payload bytes.
    ///
    /// The contents of the block are unspecified.
    pub fn allocate(&mut self, size: usize) -> Result<BlockPtr, HeapError> {
        ensure!(
            size > 0,
            InvalidArgumentSnafu {
                reason: "zero-sized allocation",
            }
        );
        let node_size = node_size_for(size).context(OutOfMemorySnafu { size })?;
        let node = self.find_fit(node_size).context(OutOfMemorySnafu { size })?;
        Ok(self.allocate_node(node, node_size))
    }

    /// Resizes a block, C `realloc` style.
    ///
    /// A null `ptr` allocates a new block and a zero `size` frees `ptr`,
    /// returning `None`. Otherwise see [`resize`](Self::resize).
    pub fn reallocate(
        &mut self,
        ptr: BlockPtr,
        size: usize,
    ) -> Result<Option<BlockPtr>, HeapError> {
        if ptr.is_null() {
            return self.allocate(size).map(Some);
        }
        if size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }
        self.resize(ptr, size).map(Some)
    }

    /// Resizes the allocated block `ptr` to hold `size` payload bytes.
    ///
    /// Growing moves the payload into a fresh block and frees the old one; if
    /// no fresh block is available the original block stays valid. Shrinking
    /// happens in place, and the freed tail is returned to the heap only when
    /// it spans at least one page.
    pub fn resize(&mut self, ptr: BlockPtr, size: usize) -> Result<BlockPtr, HeapError> {
        ensure!(
            !ptr.is_null() && size > 0,
            InvalidArgumentSnafu {
                reason: "resize needs a block and a non-zero size",
            }
        );
        let node = self.allocated_node(ptr)?;
        let node_size = self.header(node).size();
        let data_size = node_size - ALLOC_OFFSET;

        if data_size < size {
            let new_ptr = self.allocate(size)?;
            let src = ptr.offset();
            self.region
                .copy_within(src..src + data_size, new_ptr.offset());
            self.free(ptr)?;
            trace!("arena: moved {ptr} to {new_ptr} ({data_size} -> {size} bytes)");
            return Ok(new_ptr);
        }

        let new_size = node_size_for(size).context(OutOfMemorySnafu { size })?;
        if node_size - new_size < PAGE_SIZE {
            return Ok(ptr);
        }

        // Carve the tail off as an allocated node and release it through
        // `free`, which coalesces it with whatever follows.
        let rest = node + new_size;
        self.write(rest, &NodeHeader::new(MARK_ALLOCATED, node_size - new_size, Some(node)));
        self.set_prev_node(node + node_size, Some(rest));
        self.update_header(node, |header| header.size = node::to_raw(new_size));
        self.free(BlockPtr::from_offset(rest + ALLOC_OFFSET))?;
        trace!("arena: shrank {ptr} to {new_size} bytes");
        Ok(ptr)
    }

    /// Returns a block to the arena, merging it with free neighbors.
    ///
    /// Fails with [`HeapError::Corrupted`] when `ptr` does not lead to an
    /// allocated node, which covers double frees and foreign pointers.
    pub fn free(&mut self, ptr: BlockPtr) -> Result<(), HeapError> {
        ensure!(
            !ptr.is_null(),
            InvalidArgumentSnafu {
                reason: "null block pointer",
            }
        );
        let mut node = self.allocated_node(ptr)?;
        let size = self.header(node).size();
        self.available += size;

        let next = node + size;
        let prev = self
            .header(node)
            .prev_node()
            .filter(|&prev| self.header(prev).mark == MARK_FREE);
        if let Some(prev) = prev {
            self.unlink_free(prev);
            self.update_header(prev, |header| header.size += node::to_raw(size));
            self.set_prev_node(next, Some(prev));
            self.set_mark(node, MARK_DEAD);
            node = prev;
        }

        let next_header = self.header(next);
        if next_header.mark == MARK_FREE {
            let next_size = next_header.size();
            self.unlink_free(next);
            self.update_header(node, |header| header.size += node::to_raw(next_size));
            self.set_prev_node(next + next_size, Some(node));
            self.set_mark(next, MARK_DEAD);
        }

        self.set_mark(node, MARK_FREE);
        self.push_free(node);
        trace!("arena: freed {ptr} ({size} bytes)");
        Ok(())
    }

    /// Returns the payload of an allocated block.
    pub fn block(&self, ptr: BlockPtr) -> Result<&[u8], HeapError> {
        let node = self.allocated_node(ptr)?;
        let end = node + self.header(node).size();
        Ok(&self.region[ptr.offset()..end])
    }

    /// Returns the payload of an allocated block for writing.
    pub fn block_mut(&mut self, ptr: BlockPtr) -> Result<&mut [u8], HeapError> {
        let node = self.allocated_node(ptr)?;
        let end = node + self.header(node).size();
        Ok(&mut self.region[ptr.offset()..end])
    }

    /// Walks every node between the sentinels in address order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeInfo> + '_ {
        let mut cursor = self.is_initialized().then_some(PAGE_SIZE);
        iter::from_fn(move || {
            let node = cursor.filter(|&node| node < self.tail)?;
            let info = self.info(node);
            cursor = Some(info.end());
            Some(info)
        })
    }

    /// Walks the free list from its head.
    pub fn free_nodes(&self) -> impl Iterator<Item = NodeInfo> + '_ {
        let mut cursor = node::decode(self.free_list_head);
        iter::from_fn(move || {
            let node = cursor?;
            cursor = node::decode(self.links(node).next_free);
            Some(self.info(node))
        })
    }

    /// Locates the node behind `ptr` and checks that it is a live allocation.
    fn allocated_node(&self, ptr: BlockPtr) -> Result<usize, HeapError> {
        let node = ptr
            .offset()
            .checked_sub(ALLOC_OFFSET)
            .filter(|&node| {
                node >= PAGE_SIZE && node < self.tail && node.is_multiple_of(PAGE_SIZE)
            })
            .context(CorruptedSnafu {
                offset: ptr.offset(),
            })?;
        let header = self.header(node);
        ensure!(
            header.mark == MARK_ALLOCATED
                && header.size() >= PAGE_SIZE
                && header.size().is_multiple_of(PAGE_SIZE)
                && header.size() <= self.tail - node,
            CorruptedSnafu { offset: node }
        );
        Ok(node)
    }

    fn find_fit(&self, size: usize) -> Option<usize> {
        let mut fit: Option<(usize, usize)> = None;
        let mut cursor = node::decode(self.free_list_head);
        while let Some(node) = cursor {
            let node_size = self.header(node).size();
            if node_size >= size {
                match self.policy {
                    FitPolicy::FirstFit => return Some(node),
                    FitPolicy::BestFit if node_size == size => return Some(node),
                    FitPolicy::BestFit => {
                        if fit.is_none_or(|(_, fit_size)| node_size < fit_size) {
                            fit = Some((node, node_size));
                        }
                    }
                }
            }
            cursor = node::decode(self.links(node).next_free);
        }
        fit.map(|(node, _)| node)
    }

    fn allocate_node(&mut self, node: usize, size: usize) -> BlockPtr {
        let node_size = self.header(node).size();
        if node_size >= size + SPLIT_THRESHOLD {
            let rest = node + size;
            let rest_size = node_size - size;
            self.write(rest, &NodeHeader::new(MARK_FREE, rest_size, Some(node)));
            self.push_free(rest);
            self.set_prev_node(rest + rest_size, Some(rest));
            self.update_header(node, |header| header.size = node::to_raw(size));
        }

        self.unlink_free(node);
        self.set_mark(node, MARK_ALLOCATED);

        self.available -= self.header(node).size();
        self.min_available = self.min_available.min(self.available);

        let ptr = BlockPtr::from_offset(node + ALLOC_OFFSET);
        trace!("arena: allocated {ptr} ({} bytes)", self.header(node).size());
        ptr
    }

    fn push_free(&mut self, node: usize) {
        let head = self.free_list_head;
        if let Some(head) = node::decode(head) {
            self.update_links(head, |links| links.prev_free = node::to_raw(node));
        }
        self.write(node + ALLOC_OFFSET, &FreeLinks {
            prev_free: NIL,
            next_free: head,
        });
        self.free_list_head = node::to_raw(node);
    }

    fn unlink_free(&mut self, node: usize) {
        let links = self.links(node);
        if let Some(next) = node::decode(links.next_free) {
            self.update_links(next, |next| next.prev_free = links.prev_free);
        }
        if let Some(prev) = node::decode(links.prev_free) {
            self.update_links(prev, |prev| prev.next_free = links.next_free);
        }
        if self.free_list_head == node::to_raw(node) {
            self.free_list_head = links.next_free;
        }
        self.write(node + ALLOC_OFFSET, &FreeLinks::UNLINKED);
    }

    fn info(&self, node: usize) -> NodeInfo {
        let header = self.header(node);
        NodeInfo {
            offset: node,
            size: header.size(),
            prev: header.prev_node(),
            state: header.state(),
        }
    }

    fn header(&self, node: usize) -> NodeHeader {
        DataView::from(&*self.region).read(node)
    }

    fn links(&self, node: usize) -> FreeLinks {
        DataView::from(&*self.region).read(node + ALLOC_OFFSET)
    }

    fn write<T>(&mut self, offset: usize, value: &T)
    where
        T: Pod,
    {
        DataView::from_mut(&mut *self.region).write(offset, value);
    }

    fn update_header(&mut self, node: usize, f: impl FnOnce(&mut NodeHeader)) {
        let mut header = self.header(node);
        f(&mut header);
        self.write(node, &header);
    }

    fn update_links(&mut self, node: usize, f: impl FnOnce(&mut FreeLinks)) {
        let mut links = self.links(node);
        f(&mut links);
        self.write(node + ALLOC_OFFSET, &links);
    }

    fn set_mark(&mut self, node: usize, mark: u32) {
        self.update_header(node, |header| header.mark = mark);
    }

    fn set_prev_node(&mut self, node: usize, prev: Option<usize>) {
        self.update_header(node, |header| header.prev_node = node::encode(prev));
    }
}

/// Node size needed to serve `size` payload bytes.
fn node_size_for(size: usize) -> Option<usize> {
    size.checked_add(ALLOC_OFFSET)?
        .checked_next_multiple_of(PAGE_SIZE)
        .filter(|&size| size <= MAX_ARENA_SIZE)
}
