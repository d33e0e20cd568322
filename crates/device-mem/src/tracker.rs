//! Allocation tracking for one device.

use core::cmp;

use arena_heap::{Arena, BlockPtr, Heap, HeapError};
use log::{debug, trace, warn};
use snafu::{IntoError as _, OptionExt as _, ResultExt as _, ensure};
use snafu_utils::Report;
use spin::Mutex;

use crate::{
    GUARD_FILL, GUARD_SIZE, HASH_SIZE,
    env::{DefaultEnvironment, Environment, Severity, TaskId},
    error::{
        ForeignPointerSnafu, GuardOverwrittenSnafu, HeapSnafu, InvalidSizeSnafu,
        NotConfiguredSnafu, OutOfMemorySnafu, ReleaseFailedSnafu, TrackerError,
    },
    table::{HashTable, RECORD_SIZE, Record},
};

/// Largest request accepted; anything above reads as negative in 32 bits.
const MAX_REQUEST: u32 = i32::MAX.unsigned_abs();

/// Memory accounting for one device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemStats {
    /// Payload bytes currently held.
    pub count: usize,
    /// High-water mark of `count`.
    pub maxused: usize,
    /// Blocks currently held.
    pub blocks: usize,
}

impl MemStats {
    fn add(&mut self, size: usize) {
        self.count += size;
        self.maxused = cmp::max(self.maxused, self.count);
    }

    fn remove(&mut self, size: usize) {
        self.count = self.count.saturating_sub(size);
    }
}

/// Buffer sizes the file system layer negotiated for a device.
///
/// Only recorded for the file system to read back; the tracker itself sizes
/// nothing from it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub blockinfo_buffer_size: usize,
    pub page_buffer_size: usize,
    pub tree_buffer_size: usize,
    pub one_page_buffer_size: usize,
}

/// One live allocation, as reported by [`DeviceAllocator::for_each_allocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: BlockPtr,
    pub size: usize,
    pub owner: TaskId,
}

#[derive(Debug)]
struct DeviceState {
    table: Option<HashTable>,
    stats: MemStats,
    config: DeviceConfig,
}

/// Per-device allocator on top of a shared [`Heap`].
///
/// Every block is recorded in a hash table keyed by its pointer, together
/// with its size and the task that requested it, and is wrapped in
/// [`GUARD_SIZE`] bytes of [`GUARD_FILL`] on both sides. Freeing a pointer
/// this device never handed out is refused without touching the heap, and
/// [`release`](Self::release) reclaims whatever the device leaked.
///
/// The device state lock is always taken before the heap lock.
#[derive(Debug)]
pub struct DeviceAllocator<'h, 'a, E = DefaultEnvironment> {
    heap: &'h Heap<'a>,
    env: E,
    state: Mutex<DeviceState>,
}

impl<'h, 'a> DeviceAllocator<'h, 'a> {
    #[must_use]
    pub const fn with_default_env(heap: &'h Heap<'a>) -> Self {
        Self::new(heap, DefaultEnvironment)
    }
}

impl<'h, 'a, E> DeviceAllocator<'h, 'a, E>
where
    E: Environment,
{
    /// Creates an unconfigured allocator; call [`init`](Self::init) before use.
    #[must_use]
    pub const fn new(heap: &'h Heap<'a>, env: E) -> Self {
        Self {
            heap,
            env,
            state: Mutex::new(DeviceState {
                table: None,
                stats: MemStats {
                    count: 0,
                    maxused: 0,
                    blocks: 0,
                },
                config: DeviceConfig {
                    blockinfo_buffer_size: 0,
                    page_buffer_size: 0,
                    tree_buffer_size: 0,
                    one_page_buffer_size: 0,
                },
            }),
        }
    }

    /// Starts tracking with an empty table and zeroed counters.
    ///
    /// Blocks still recorded from a previous session are forgotten, not
    /// freed; call [`release`](Self::release) first.
    pub fn init(&self, config: DeviceConfig) {
        let mut state = self.state.lock();
        if state.table.is_some() && state.stats.blocks > 0 {
            warn!(
                "mem: re-initializing with {} blocks still recorded",
                state.stats.blocks
            );
        }
        *state = DeviceState {
            table: Some(HashTable::new()),
            stats: MemStats::default(),
            config,
        };
        debug!("mem: device allocator initialized with {config:?}");
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.state.lock().table.is_some()
    }

    #[must_use]
    pub fn config(&self) -> DeviceConfig {
        self.state.lock().config
    }

    #[must_use]
    pub fn stats(&self) -> MemStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn heap(&self) -> &'h Heap<'a> {
        self.heap
    }

    /// Allocates a tracked block of `size` bytes. The contents are
    /// unspecified.
    pub fn malloc(&self, size: usize) -> Result<BlockPtr, TrackerError> {
        let request = checked_size(size)?;
        let task_id = self.env.current_task_id();
        self.with_state(|table, stats, arena| {
            allocate_tracked(table, stats, arena, size, request, task_id)
        })
    }

    /// Allocates a zeroed block for `num` elements of `size` bytes.
    pub fn calloc(&self, num: usize, size: usize) -> Result<BlockPtr, TrackerError> {
        let total = num.checked_mul(size).context(InvalidSizeSnafu {
            size: num.saturating_mul(size),
        })?;
        let request = checked_size(total)?;
        let task_id = self.env.current_task_id();
        self.with_state(|table, stats, arena| {
            let ptr = allocate_tracked(table, stats, arena, total, request, task_id)?;
            payload_mut(arena, ptr, total)?.fill(0);
            Ok(ptr)
        })
    }

    /// Resizes a tracked block, C `realloc` style.
    ///
    /// A null `ptr` allocates and a zero `size` frees, returning `None`.
    /// Otherwise the block keeps its contents up to the smaller of the two
    /// sizes; on failure the original block stays valid and tracked.
    pub fn realloc(&self, ptr: BlockPtr, size: usize) -> Result<Option<BlockPtr>, TrackerError> {
        if ptr.is_null() {
            return self.malloc(size).map(Some);
        }
        if size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }
        let request = checked_size(size)?;
        let task_id = self.env.current_task_id();
        self.with_state(|table, stats, arena| {
            let slot = table
                .find(arena, ptr)
                .context(HeapSnafu { ptr })?
                .context(ForeignPointerSnafu { ptr })?;
            let old_size = slot.record.size();
            ensure!(
                guards_intact(arena, ptr, old_size).context(HeapSnafu { ptr })?,
                GuardOverwrittenSnafu { ptr }
            );

            let block = ptr.sub(GUARD_SIZE);
            let new_block = arena
                .resize(block, guarded_size(size))
                .map_err(|source| heap_failure(source, size, ptr))?;
            write_guards(arena, new_block, size).context(HeapSnafu { ptr: new_block })?;
            let new_ptr = new_block.add(GUARD_SIZE);

            // The record block is reused; only its chain may change.
            if new_ptr == ptr {
                HashTable::update(arena, &slot, new_ptr, request, task_id)
                    .context(HeapSnafu { ptr: slot.handle })?;
            } else {
                table
                    .unlink(arena, &slot)
                    .context(HeapSnafu { ptr: slot.handle })?;
                table
                    .insert(arena, slot.handle, Record::new(new_ptr, request, task_id))
                    .context(HeapSnafu { ptr: slot.handle })?;
            }

            stats.remove(old_size);
            stats.add(size);
            trace!("mem: realloc {ptr} -> {new_ptr} ({old_size} -> {size} bytes)");
            Ok(new_ptr)
        })
        .map(Some)
    }

    /// Frees a tracked block.
    ///
    /// A pointer this device does not know is refused with
    /// [`TrackerError::ForeignPointer`] and the heap is left alone. Damaged
    /// guard bytes are reported after the block has been freed anyway.
    pub fn free(&self, ptr: BlockPtr) -> Result<(), TrackerError> {
        self.with_state(|table, stats, arena| {
            let slot = table
                .find(arena, ptr)
                .context(HeapSnafu { ptr })?
                .context(ForeignPointerSnafu { ptr })?;
            let size = slot.record.size();
            let intact = guards_intact(arena, ptr, size).context(HeapSnafu { ptr })?;

            table
                .unlink(arena, &slot)
                .context(HeapSnafu { ptr: slot.handle })?;
            stats.remove(size);
            stats.blocks -= 1;
            arena
                .free(slot.handle)
                .context(HeapSnafu { ptr: slot.handle })?;
            arena
                .free(ptr.sub(GUARD_SIZE))
                .context(HeapSnafu { ptr })?;
            trace!("mem: free {ptr} ({size} bytes)");

            ensure!(intact, GuardOverwrittenSnafu { ptr });
            Ok(())
        })
    }

    /// Frees every block still recorded and returns how many there were.
    ///
    /// A record that cannot be reclaimed does not stop the sweep: the
    /// remaining records are still freed, and the first failure is returned
    /// as [`TrackerError::ReleaseFailed`] afterwards. The table stays
    /// configured.
    pub fn release_all(&self) -> Result<usize, TrackerError> {
        self.with_state(|table, stats, arena| {
            let mut released = 0;
            let mut failure = None;
            for bucket in 0..HASH_SIZE {
                loop {
                    let (handle, record) = match table.pop(arena, bucket) {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break,
                        Err(source) => {
                            // The rest of this chain is unreachable.
                            failure.get_or_insert(source);
                            break;
                        }
                    };
                    let ptr = record.ptr();
                    let size = record.size();
                    stats.remove(size);
                    stats.blocks = stats.blocks.saturating_sub(1);
                    trace!(
                        "mem: reclaiming {ptr} ({size} bytes, {})",
                        record.task_id()
                    );

                    let freed_record = arena.free(handle);
                    match freed_record.and(reclaim_block(arena, &record)) {
                        Ok(intact) => {
                            if !intact {
                                self.env.report(
                                    Severity::Serious,
                                    format_args!(
                                        "guard bytes around leaked block {ptr} were overwritten"
                                    ),
                                );
                            }
                            released += 1;
                        }
                        Err(source) => {
                            failure.get_or_insert(source);
                        }
                    }
                }
            }
            match failure {
                Some(source) => Err(ReleaseFailedSnafu { released }.into_error(source)),
                None => Ok(released),
            }
        })
    }

    /// Tears the device down: reclaims leaked blocks and drops the table.
    ///
    /// Leaks are reported at [`Severity::Normal`] and a failed teardown at
    /// [`Severity::Serious`]. The device is unconfigured afterwards either
    /// way.
    pub fn release(&self) -> Result<usize, TrackerError> {
        let result = self.release_all();
        match &result {
            Ok(0) => {}
            Ok(leaked) => self.env.report(
                Severity::Normal,
                format_args!("found {leaked} leaked memory blocks"),
            ),
            Err(err) if !err.is_serious() => self.env.report(
                Severity::Serious,
                format_args!("failed to release device memory: {}", Report::new(err)),
            ),
            Err(_) => {}
        }
        self.state.lock().table = None;
        result
    }

    /// Visits every live allocation of this device.
    ///
    /// `f` runs with the device and heap locks held and must not call back
    /// into this allocator or its heap.
    pub fn for_each_allocation<F>(&self, mut f: F) -> Result<(), TrackerError>
    where
        F: FnMut(Allocation),
    {
        self.with_state(|table, _, arena| {
            table
                .for_each(arena, |record| {
                    f(Allocation {
                        ptr: record.ptr(),
                        size: record.size(),
                        owner: record.task_id(),
                    });
                })
                .context(HeapSnafu {
                    ptr: BlockPtr::NULL,
                })
        })
    }

    /// Runs `f` on the payload of a tracked block.
    ///
    /// `f` runs with the device and heap locks held and must not call back
    /// into this allocator or its heap.
    pub fn with_block<F, R>(&self, ptr: BlockPtr, f: F) -> Result<R, TrackerError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.with_block_mut(ptr, |bytes| f(bytes))
    }

    /// Runs `f` on the payload of a tracked block for writing.
    ///
    /// The slice covers exactly the requested size, so the guard bytes are
    /// out of reach. As with [`with_block`](Self::with_block), `f` must not
    /// call back into this allocator or its heap.
    pub fn with_block_mut<F, R>(&self, ptr: BlockPtr, f: F) -> Result<R, TrackerError>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        self.with_state(|table, _, arena| {
            let slot = table
                .find(arena, ptr)
                .context(HeapSnafu { ptr })?
                .context(ForeignPointerSnafu { ptr })?;
            Ok(f(payload_mut(arena, ptr, slot.record.size())?))
        })
    }

    /// Takes the device lock, then the heap lock, and runs `f`.
    fn with_state<F, R>(&self, f: F) -> Result<R, TrackerError>
    where
        F: FnOnce(&mut HashTable, &mut MemStats, &mut Arena<'a>) -> Result<R, TrackerError>,
    {
        let mut state = self.state.lock();
        let DeviceState { table, stats, .. } = &mut *state;
        let table = table.as_mut().context(NotConfiguredSnafu)?;
        self.heap
            .critical_section(|arena| f(table, stats, arena))
            .inspect_err(|err| {
                if let Some(severity) = err.severity() {
                    self.env.report(severity, format_args!("{}", Report::new(err)));
                }
            })
    }
}

fn checked_size(size: usize) -> Result<u32, TrackerError> {
    u32::try_from(size)
        .ok()
        .filter(|&request| request <= MAX_REQUEST)
        .context(InvalidSizeSnafu { size })
}

fn guarded_size(size: usize) -> usize {
    size + GUARD_SIZE * 2
}

fn heap_failure(source: HeapError, size: usize, ptr: BlockPtr) -> TrackerError {
    if source.is_out_of_memory() {
        OutOfMemorySnafu { size }.into_error(source)
    } else {
        HeapSnafu { ptr }.into_error(source)
    }
}

fn allocate_tracked(
    table: &mut HashTable,
    stats: &mut MemStats,
    arena: &mut Arena<'_>,
    size: usize,
    request: u32,
    task_id: TaskId,
) -> Result<BlockPtr, TrackerError> {
    let block = arena
        .allocate(guarded_size(size))
        .map_err(|source| heap_failure(source, size, BlockPtr::NULL))?;
    let handle = match arena.allocate(RECORD_SIZE) {
        Ok(handle) => handle,
        Err(source) => {
            arena.free(block).context(HeapSnafu { ptr: block })?;
            return Err(heap_failure(source, size, BlockPtr::NULL));
        }
    };
    write_guards(arena, block, size).context(HeapSnafu { ptr: block })?;
    let ptr = block.add(GUARD_SIZE);
    table
        .insert(arena, handle, Record::new(ptr, request, task_id))
        .context(HeapSnafu { ptr: handle })?;
    stats.add(size);
    stats.blocks += 1;
    trace!("mem: malloc {size} bytes at {ptr} for {task_id}");
    Ok(ptr)
}

/// Frees the guarded block behind `record`, reporting whether its guards
/// were still intact.
fn reclaim_block(arena: &mut Arena<'_>, record: &Record) -> Result<bool, HeapError> {
    let ptr = record.ptr();
    let intact = guards_intact(arena, ptr, record.size())?;
    arena.free(ptr.sub(GUARD_SIZE))?;
    Ok(intact)
}

fn payload_mut<'r>(
    arena: &'r mut Arena<'_>,
    ptr: BlockPtr,
    size: usize,
) -> Result<&'r mut [u8], TrackerError> {
    let bytes = arena
        .block_mut(ptr.sub(GUARD_SIZE))
        .context(HeapSnafu { ptr })?;
    bytes
        .get_mut(GUARD_SIZE..GUARD_SIZE + size)
        .context(GuardOverwrittenSnafu { ptr })
}

fn write_guards(arena: &mut Arena<'_>, block: BlockPtr, size: usize) -> Result<(), HeapError> {
    let bytes = arena.block_mut(block)?;
    bytes[..GUARD_SIZE].fill(GUARD_FILL);
    bytes[GUARD_SIZE + size..guarded_size(size)].fill(GUARD_FILL);
    Ok(())
}

fn guards_intact(arena: &Arena<'_>, ptr: BlockPtr, size: usize) -> Result<bool, HeapError> {
    let bytes = arena.block(ptr.sub(GUARD_SIZE))?;
    let (Some(front), Some(back)) = (
        bytes.get(..GUARD_SIZE),
        bytes.get(GUARD_SIZE + size..guarded_size(size)),
    ) else {
        return Ok(false);
    };
    Ok(front.iter().chain(back).all(|&b| b == GUARD_FILL))
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{fmt, sync::Mutex as StdMutex};

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingEnv {
        task: u32,
        reports: StdMutex<Vec<(Severity, String)>>,
    }

    impl RecordingEnv {
        fn reports(&self) -> Vec<(Severity, String)> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl Environment for RecordingEnv {
        fn current_task_id(&self) -> TaskId {
            TaskId(self.task)
        }

        fn report(&self, severity: Severity, message: fmt::Arguments<'_>) {
            self.reports
                .lock()
                .unwrap()
                .push((severity, message.to_string()));
        }
    }

    fn with_device<F>(size: usize, f: F)
    where
        F: FnOnce(&DeviceAllocator<'_, '_, &RecordingEnv>, &RecordingEnv),
    {
        let mut region = vec![0u8; size];
        let heap = Heap::new();
        heap.init(&mut region);
        let env = RecordingEnv {
            task: 42,
            ..RecordingEnv::default()
        };
        let device = DeviceAllocator::new(&heap, &env);
        device.init(DeviceConfig::default());
        f(&device, &env);
    }

    #[test]
    fn test_unconfigured_device() {
        let mut region = vec![0u8; 1024];
        let heap = Heap::new();
        heap.init(&mut region);
        let available = heap.stats().available;
        let device = DeviceAllocator::with_default_env(&heap);

        assert!(!device.is_configured());
        assert!(matches!(
            device.malloc(10),
            Err(TrackerError::NotConfigured { .. })
        ));
        assert!(matches!(
            device.free(BlockPtr::from_offset(64)),
            Err(TrackerError::NotConfigured { .. })
        ));
        assert_eq!(heap.stats().available, available);
    }

    #[test]
    fn test_init_records_config() {
        with_device(1024, |device, _| {
            let config = DeviceConfig {
                blockinfo_buffer_size: 10,
                page_buffer_size: 20,
                tree_buffer_size: 30,
                one_page_buffer_size: 40,
            };
            device.init(config);
            assert!(device.is_configured());
            assert_eq!(device.config(), config);
            assert_eq!(device.stats(), MemStats::default());
        });
    }

    #[test]
    fn test_malloc_tracks_and_guards() {
        with_device(4096, |device, _| {
            let ptr = device.malloc(100).unwrap();
            assert_eq!(
                device.stats(),
                MemStats {
                    count: 100,
                    maxused: 100,
                    blocks: 1,
                }
            );

            device.heap().critical_section(|arena| {
                let bytes = arena.block(ptr.sub(GUARD_SIZE)).unwrap();
                assert!(bytes[..GUARD_SIZE].iter().all(|&b| b == GUARD_FILL));
                assert!(bytes[GUARD_SIZE + 100..][..GUARD_SIZE].iter().all(|&b| b == GUARD_FILL));
            });

            let mut seen = Vec::new();
            device.for_each_allocation(|a| seen.push(a)).unwrap();
            assert_eq!(
                seen,
                [Allocation {
                    ptr,
                    size: 100,
                    owner: TaskId(42),
                }]
            );

            device.free(ptr).unwrap();
            assert_eq!(
                device.stats(),
                MemStats {
                    count: 0,
                    maxused: 100,
                    blocks: 0,
                }
            );
        });
    }

    #[test]
    fn test_invalid_sizes() {
        with_device(1024, |device, env| {
            for size in [usize::MAX, 1 << 31] {
                assert!(matches!(
                    device.malloc(size),
                    Err(TrackerError::InvalidSize { .. })
                ));
            }
            assert!(matches!(
                device.calloc(usize::MAX, 2),
                Err(TrackerError::InvalidSize { .. })
            ));
            assert!(matches!(
                device.malloc(4096),
                Err(TrackerError::OutOfMemory { .. })
            ));
            assert_eq!(device.stats(), MemStats::default());
            assert!(env.reports().is_empty());
        });
    }

    #[test]
    fn test_calloc_zeroes() {
        with_device(2048, |device, _| {
            let ptr = device.malloc(64).unwrap();
            device.with_block_mut(ptr, |bytes| bytes.fill(0xee)).unwrap();
            device.free(ptr).unwrap();

            let ptr = device.calloc(8, 8).unwrap();
            device
                .with_block(ptr, |bytes| {
                    assert_eq!(bytes.len(), 64);
                    assert!(bytes.iter().all(|&b| b == 0));
                })
                .unwrap();
            assert_eq!(device.stats().count, 64);
        });
    }

    #[test]
    fn test_foreign_pointer_is_refused() {
        with_device(2048, |device, env| {
            let available = device.heap().stats().available;
            let foreign = device.heap().allocate(40).unwrap();

            let err = device.free(foreign).unwrap_err();
            assert!(matches!(err, TrackerError::ForeignPointer { .. }));
            assert!(!err.is_serious());
            let reports = env.reports();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].0, Severity::Normal);

            // Still allocated and intact.
            device.heap().free(foreign).unwrap();
            assert_eq!(device.heap().stats().available, available);
        });
    }

    #[test]
    fn test_double_free_is_foreign() {
        with_device(2048, |device, _| {
            let ptr = device.malloc(10).unwrap();
            device.free(ptr).unwrap();
            assert!(matches!(
                device.free(ptr),
                Err(TrackerError::ForeignPointer { .. })
            ));
        });
    }

    #[test]
    fn test_guard_overwrite_detected_on_free() {
        with_device(2048, |device, env| {
            let available = device.heap().stats().available;
            let ptr = device.malloc(16).unwrap();
            device.heap().critical_section(|arena| {
                arena.block_mut(ptr.sub(GUARD_SIZE)).unwrap()[GUARD_SIZE + 16] = 0;
            });

            let err = device.free(ptr).unwrap_err();
            assert!(matches!(err, TrackerError::GuardOverwritten { .. }));
            assert!(err.is_serious());
            assert_eq!(env.reports()[0].0, Severity::Serious);
            // Freed regardless.
            assert_eq!(device.stats().blocks, 0);
            assert_eq!(device.heap().stats().available, available);
        });
    }

    #[test]
    fn test_realloc_semantics() {
        with_device(4096, |device, _| {
            let ptr = device.realloc(BlockPtr::NULL, 20).unwrap().unwrap();
            device
                .with_block_mut(ptr, |bytes| bytes.copy_from_slice(&[7; 20]))
                .unwrap();

            let grown = device.realloc(ptr, 300).unwrap().unwrap();
            assert_ne!(grown, ptr);
            device
                .with_block(grown, |bytes| {
                    assert_eq!(bytes.len(), 300);
                    assert_eq!(&bytes[..20], &[7; 20]);
                })
                .unwrap();
            assert_eq!(
                device.stats(),
                MemStats {
                    count: 300,
                    maxused: 300,
                    blocks: 1,
                }
            );

            let shrunk = device.realloc(grown, 10).unwrap().unwrap();
            assert_eq!(shrunk, grown);
            device
                .with_block(shrunk, |bytes| assert_eq!(bytes, &[7; 10]))
                .unwrap();
            assert_eq!(device.stats().count, 10);

            assert_eq!(device.realloc(shrunk, 0).unwrap(), None);
            assert_eq!(device.stats().blocks, 0);
            assert!(matches!(
                device.realloc(shrunk, 8),
                Err(TrackerError::ForeignPointer { .. })
            ));
        });
    }

    #[test]
    fn test_realloc_failure_keeps_block() {
        with_device(1024, |device, _| {
            let ptr = device.malloc(32).unwrap();
            assert!(matches!(
                device.realloc(ptr, 4096),
                Err(TrackerError::OutOfMemory { .. })
            ));
            assert_eq!(device.stats().count, 32);
            device.free(ptr).unwrap();
        });
    }

    #[test]
    fn test_release_reclaims_leaks() {
        with_device(8192, |device, env| {
            let available = device.heap().stats().available;
            for size in [10, 200, 33, 1] {
                device.malloc(size).unwrap();
            }

            assert_eq!(device.release().unwrap(), 4);
            assert!(!device.is_configured());
            assert_eq!(device.stats().blocks, 0);
            assert_eq!(device.heap().stats().available, available);
            assert_eq!(env.reports(), [(Severity::Normal, "found 4 leaked memory blocks".to_string())]);

            assert!(device.release().is_err());
            assert_eq!(env.reports().last().unwrap().0, Severity::Serious);
        });
    }

    #[test]
    fn test_clean_release_is_silent() {
        with_device(1024, |device, env| {
            let ptr = device.malloc(5).unwrap();
            device.free(ptr).unwrap();
            assert_eq!(device.release().unwrap(), 0);
            assert!(env.reports().is_empty());
        });
    }

    #[test]
    fn test_failed_sweep_reclaims_healthy_records() {
        with_device(4096, |device, env| {
            let available = device.heap().stats().available;
            let broken = device.malloc(10).unwrap();
            let healthy = device.malloc(40).unwrap();
            // Release the raw block behind the tracker's back.
            device.heap().free(broken.sub(GUARD_SIZE)).unwrap();

            let err = device.release().unwrap_err();
            assert!(matches!(
                err,
                TrackerError::ReleaseFailed { released: 1, .. }
            ));
            assert!(!device.is_configured());
            assert_eq!(device.stats().blocks, 0);
            assert_eq!(device.stats().count, 0);

            // The healthy block and both records went back to the heap.
            assert_eq!(device.heap().stats().available, available);
            device
                .heap()
                .critical_section(|arena| assert_eq!(arena.nodes().count(), 1));
            assert!(device.heap().free(healthy.sub(GUARD_SIZE)).is_err());

            let reports = env.reports();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].0, Severity::Serious);
            assert!(reports[0].1.contains("failed to release"));
        });
    }

    #[test]
    fn test_realloc_refuses_damaged_guards() {
        with_device(2048, |device, env| {
            let before = device.heap().stats().available;
            let ptr = device.malloc(24).unwrap();
            let allocated = device.heap().stats().available;
            device.heap().critical_section(|arena| {
                arena.block_mut(ptr.sub(GUARD_SIZE)).unwrap()[3] = 0;
            });

            let err = device.realloc(ptr, 200).unwrap_err();
            assert!(matches!(err, TrackerError::GuardOverwritten { .. }));
            assert_eq!(env.reports()[0].0, Severity::Serious);
            assert_eq!(device.stats().count, 24);
            assert_eq!(device.stats().blocks, 1);
            assert_eq!(device.heap().stats().available, allocated);
            let mut seen = Vec::new();
            device.for_each_allocation(|a| seen.push(a.ptr)).unwrap();
            assert_eq!(seen, [ptr]);

            assert!(matches!(
                device.free(ptr),
                Err(TrackerError::GuardOverwritten { .. })
            ));
            assert_eq!(device.stats().blocks, 0);
            assert_eq!(device.heap().stats().available, before);
        });
    }

    #[test]
    fn test_sweep_reports_damaged_guards() {
        with_device(2048, |device, env| {
            let available = device.heap().stats().available;
            let ptr = device.malloc(12).unwrap();
            device.heap().critical_section(|arena| {
                arena.block_mut(ptr.sub(GUARD_SIZE)).unwrap()[GUARD_SIZE + 12] = 0;
            });

            assert_eq!(device.release_all().unwrap(), 1);
            assert!(device.is_configured());
            assert_eq!(device.heap().stats().available, available);
            let reports = env.reports();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].0, Severity::Serious);
            assert!(reports[0].1.contains("guard bytes"));
        });
    }
}
