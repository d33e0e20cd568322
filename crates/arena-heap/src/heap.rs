//! Shared, lock-protected access to an [`Arena`].

use log::error;
use snafu_utils::Report;
use spin::Mutex;

use crate::{
    BlockPtr, FitPolicy, HeapStats,
    arena::Arena,
    error::HeapError,
};

/// An [`Arena`] behind a critical section.
///
/// Every entry point takes the lock once and releases it when its guard goes
/// out of scope, on success and on every failure path alike. Entry points do
/// not nest: code that needs several arena steps under one acquisition uses
/// [`critical_section`](Self::critical_section) and calls the [`Arena`]
/// methods directly.
///
/// ```
/// use arena_heap::Heap;
///
/// let mut region = vec![0u8; 4096];
/// let heap = Heap::new();
/// heap.init(&mut region);
///
/// let ptr = heap.allocate(100).unwrap();
/// heap.critical_section(|arena| arena.block_mut(ptr).unwrap().fill(0));
/// heap.free(ptr).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct Heap<'a> {
    arena: Mutex<Arena<'a>>,
}

impl<'a> Heap<'a> {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_policy(FitPolicy::BestFit)
    }

    #[must_use]
    pub const fn with_policy(policy: FitPolicy) -> Self {
        Self {
            arena: Mutex::new(Arena::with_policy(policy)),
        }
    }

    /// Registers the memory region. See [`Arena::init`].
    pub fn init(&self, region: &'a mut [u8]) {
        self.arena.lock().init(region);
    }

    pub fn allocate(&self, size: usize) -> Result<BlockPtr, HeapError> {
        self.critical_section(|arena| arena.allocate(size))
            .inspect_err(report_corruption)
    }

    pub fn reallocate(&self, ptr: BlockPtr, size: usize) -> Result<Option<BlockPtr>, HeapError> {
        self.critical_section(|arena| arena.reallocate(ptr, size))
            .inspect_err(report_corruption)
    }

    pub fn free(&self, ptr: BlockPtr) -> Result<(), HeapError> {
        self.critical_section(|arena| arena.free(ptr))
            .inspect_err(report_corruption)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.arena.lock().stats()
    }

    /// Runs `f` with exclusive access to the arena.
    ///
    /// `f` must not call back into this `Heap`; the lock is not reentrant.
    pub fn critical_section<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Arena<'a>) -> R,
    {
        let mut arena = self.arena.lock();
        f(&mut arena)
    }
}

fn report_corruption(err: &HeapError) {
    if err.is_corrupted() {
        error!("{}", Report::new(err));
    }
}
