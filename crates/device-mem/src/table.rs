//! Chained hash table of live allocations.
//!
//! Records live inside the arena they describe, each in a block of its own,
//! and are chained through their `next` field. Only the bucket heads are kept
//! outside the arena.

use arena_heap::{ALLOC_OFFSET, Arena, BlockPtr, HeapError, PAGE_SHIFT, PAGE_SIZE};
use dataview::{DataView, Pod};

use crate::{HASH_SIZE, env::TaskId};

const NIL: u32 = u32::MAX;

/// Tracking record of one allocation, as stored in the arena.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub(crate) struct Record {
    ptr: u32,
    size: u32,
    task_id: u32,
    next: u32,
}

pub(crate) const RECORD_SIZE: usize = size_of::<Record>();
// Any block the arena hands out has room for a record.
const _: () = assert!(RECORD_SIZE <= PAGE_SIZE - ALLOC_OFFSET);

impl Record {
    /// `size` must already have been checked to fit in 32 bits.
    pub(crate) fn new(ptr: BlockPtr, size: u32, task_id: TaskId) -> Self {
        Self {
            ptr: ptr.to_raw(),
            size,
            task_id: task_id.0,
            next: NIL,
        }
    }

    pub(crate) fn ptr(&self) -> BlockPtr {
        BlockPtr::from_raw(self.ptr)
    }

    pub(crate) fn size(&self) -> usize {
        self.size as usize
    }

    pub(crate) fn task_id(&self) -> TaskId {
        TaskId(self.task_id)
    }

    fn next(&self) -> Option<BlockPtr> {
        (self.next != NIL).then(|| BlockPtr::from_raw(self.next))
    }
}

/// A record found by [`HashTable::find`], with enough context to unlink it.
#[derive(Debug)]
pub(crate) struct Slot {
    prev: Option<BlockPtr>,
    pub(crate) handle: BlockPtr,
    pub(crate) record: Record,
}

pub(crate) fn bucket_of(ptr: BlockPtr) -> usize {
    (ptr.offset() >> PAGE_SHIFT) & (HASH_SIZE - 1)
}

#[derive(Debug)]
pub(crate) struct HashTable {
    heads: [u32; HASH_SIZE],
}

impl HashTable {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [NIL; HASH_SIZE],
        }
    }

    pub(crate) fn find(&self, arena: &Arena<'_>, ptr: BlockPtr) -> Result<Option<Slot>, HeapError> {
        let mut prev = None;
        let mut cursor = head(self.heads[bucket_of(ptr)]);
        while let Some(handle) = cursor {
            let record = read(arena, handle)?;
            if record.ptr() == ptr {
                return Ok(Some(Slot {
                    prev,
                    handle,
                    record,
                }));
            }
            prev = Some(handle);
            cursor = record.next();
        }
        Ok(None)
    }

    /// Stores `record` in the block `handle` and pushes it on its chain.
    pub(crate) fn insert(
        &mut self,
        arena: &mut Arena<'_>,
        handle: BlockPtr,
        mut record: Record,
    ) -> Result<(), HeapError> {
        let head = &mut self.heads[bucket_of(record.ptr())];
        record.next = *head;
        write(arena, handle, &record)?;
        *head = handle.to_raw();
        Ok(())
    }

    /// Rewrites a record in place. The pointer must not change bucket.
    pub(crate) fn update(
        arena: &mut Arena<'_>,
        slot: &Slot,
        ptr: BlockPtr,
        size: u32,
        task_id: TaskId,
    ) -> Result<(), HeapError> {
        debug_assert_eq!(bucket_of(ptr), bucket_of(slot.record.ptr()));
        let record = Record {
            next: slot.record.next,
            ..Record::new(ptr, size, task_id)
        };
        write(arena, slot.handle, &record)
    }

    /// Removes `slot` from its chain. The record block itself is not freed.
    pub(crate) fn unlink(&mut self, arena: &mut Arena<'_>, slot: &Slot) -> Result<(), HeapError> {
        match slot.prev {
            Some(prev) => {
                let mut record = read(arena, prev)?;
                record.next = slot.record.next;
                write(arena, prev, &record)
            }
            None => {
                self.heads[bucket_of(slot.record.ptr())] = slot.record.next;
                Ok(())
            }
        }
    }

    /// Detaches the first record of `bucket`.
    pub(crate) fn pop(
        &mut self,
        arena: &Arena<'_>,
        bucket: usize,
    ) -> Result<Option<(BlockPtr, Record)>, HeapError> {
        let Some(handle) = head(self.heads[bucket]) else {
            return Ok(None);
        };
        let record = read(arena, handle)?;
        self.heads[bucket] = record.next;
        Ok(Some((handle, record)))
    }

    /// Visits every record, bucket by bucket.
    pub(crate) fn for_each<F>(&self, arena: &Arena<'_>, mut f: F) -> Result<(), HeapError>
    where
        F: FnMut(&Record),
    {
        for &raw in &self.heads {
            let mut cursor = head(raw);
            while let Some(handle) = cursor {
                let record = read(arena, handle)?;
                f(&record);
                cursor = record.next();
            }
        }
        Ok(())
    }
}

fn head(raw: u32) -> Option<BlockPtr> {
    (raw != NIL).then(|| BlockPtr::from_raw(raw))
}

fn read(arena: &Arena<'_>, handle: BlockPtr) -> Result<Record, HeapError> {
    Ok(DataView::from(arena.block(handle)?).read(0))
}

fn write(arena: &mut Arena<'_>, handle: BlockPtr, record: &Record) -> Result<(), HeapError> {
    DataView::from_mut(arena.block_mut(handle)?).write(0, record);
    Ok(())
}
