#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::thread;

use arena_heap::{BlockPtr, Heap};
use device_mem::{DeviceAllocator, DeviceConfig, MemStats, TrackerError};

fn with_heap<F>(size: usize, f: F)
where
    F: FnOnce(&Heap<'_>),
{
    let mut region = vec![0u8; size];
    let heap = Heap::new();
    heap.init(&mut region);
    f(&heap);
}

#[test]
fn leak_accounting() {
    with_heap(16 * 1024, |heap| {
        let available = heap.stats().available;
        let device = DeviceAllocator::with_default_env(heap);
        device.init(DeviceConfig::default());

        for size in [24, 512, 3] {
            device.malloc(size).unwrap();
        }
        assert_eq!(
            device.stats(),
            MemStats {
                count: 539,
                maxused: 539,
                blocks: 3,
            }
        );

        assert_eq!(device.release_all().unwrap(), 3);
        assert!(device.is_configured());
        assert_eq!(device.stats().count, 0);
        assert_eq!(device.stats().maxused, 539);
        assert_eq!(heap.stats().available, available);
        heap.critical_section(|arena| assert_eq!(arena.nodes().count(), 1));
    });
}

#[test]
fn devices_are_isolated() {
    with_heap(16 * 1024, |heap| {
        let a = DeviceAllocator::with_default_env(heap);
        let b = DeviceAllocator::with_default_env(heap);
        a.init(DeviceConfig::default());
        b.init(DeviceConfig::default());

        let ptr = a.malloc(100).unwrap();
        let available = heap.stats().available;
        assert!(matches!(
            b.free(ptr),
            Err(TrackerError::ForeignPointer { .. })
        ));
        assert!(matches!(
            b.realloc(ptr, 10),
            Err(TrackerError::ForeignPointer { .. })
        ));
        assert_eq!(b.stats(), MemStats::default());
        assert_eq!(heap.stats().available, available);

        // Releasing one device leaves the other's blocks alone.
        let kept = b.malloc(40).unwrap();
        assert_eq!(a.release().unwrap(), 1);
        b.with_block_mut(kept, |bytes| bytes.fill(3)).unwrap();
        b.free(kept).unwrap();
        assert_eq!(b.release().unwrap(), 0);
    });
}

#[test]
fn tracker_survives_heap_exhaustion() {
    with_heap(2048, |heap| {
        let device = DeviceAllocator::with_default_env(heap);
        device.init(DeviceConfig::default());

        let mut ptrs = Vec::new();
        loop {
            match device.malloc(64) {
                Ok(ptr) => ptrs.push(ptr),
                Err(err) => {
                    assert!(matches!(err, TrackerError::OutOfMemory { .. }));
                    break;
                }
            }
        }
        assert!(!ptrs.is_empty());
        assert_eq!(device.stats().blocks, ptrs.len());

        for ptr in ptrs.drain(..) {
            device.free(ptr).unwrap();
        }
        assert_eq!(device.stats().count, 0);
        heap.critical_section(|arena| assert_eq!(arena.nodes().count(), 1));
    });
}

#[test]
fn raw_heap_pointer_is_not_tracked() {
    with_heap(4096, |heap| {
        let device = DeviceAllocator::with_default_env(heap);
        device.init(DeviceConfig::default());
        let ptr = device.malloc(8).unwrap();

        // The tracker never hands out the block start itself.
        let raw = ptr.sub(device_mem::GUARD_SIZE);
        assert!(device.free(raw).is_err());
        assert!(device.free(BlockPtr::NULL).is_err());
        device.free(ptr).unwrap();
    });
}

#[test]
fn concurrent_devices() {
    with_heap(128 * 1024, |heap| {
        let available = heap.stats().available;

        thread::scope(|s| {
            for id in 0..4_u8 {
                s.spawn(move || {
                    let device = DeviceAllocator::with_default_env(heap);
                    device.init(DeviceConfig::default());
                    let mut live = Vec::new();
                    for round in 0..150_usize {
                        let size = usize::from(id) * 13 + round % 70 + 1;
                        let ptr = device.malloc(size).unwrap();
                        device.with_block_mut(ptr, |bytes| bytes.fill(id)).unwrap();
                        live.push(ptr);
                        if round % 3 == 0 {
                            let ptr = live.swap_remove(round % live.len());
                            device
                                .with_block(ptr, |bytes| assert!(bytes.iter().all(|&b| b == id)))
                                .unwrap();
                            device.free(ptr).unwrap();
                        }
                    }
                    assert_eq!(device.release().unwrap(), live.len());
                });
            }
        });

        assert_eq!(heap.stats().available, available);
    });
}
