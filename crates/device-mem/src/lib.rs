//! Per-device memory accounting over a shared [`arena_heap::Heap`].
//!
//! Each storage device mounted by the file system gets its own
//! [`DeviceAllocator`]. All devices draw from the same heap, but each one
//! keeps a table of the blocks it handed out, so that
//!
//! - a pointer one device never allocated cannot be freed through it,
//! - per-device usage ([`MemStats`]) is known at any time,
//! - blocks a device forgot to free are reclaimed when it is released.
//!
//! # Usage Example
//!
//! ```rust
//! use arena_heap::Heap;
//! use device_mem::{DeviceAllocator, DeviceConfig};
//!
//! let mut region = vec![0u8; 8192];
//! let heap = Heap::new();
//! heap.init(&mut region);
//! let available = heap.stats().available;
//!
//! let device = DeviceAllocator::with_default_env(&heap);
//! device.init(DeviceConfig::default());
//!
//! let ptr = device.malloc(100).unwrap();
//! device.with_block_mut(ptr, |bytes| bytes.fill(1)).unwrap();
//! let _leaked = device.malloc(20).unwrap();
//! device.free(ptr).unwrap();
//!
//! assert_eq!(device.stats().blocks, 1);
//! assert_eq!(device.release().unwrap(), 1);
//! assert_eq!(heap.stats().available, available);
//! ```
//!
//! # Block Layout
//!
//! ```text
//! ┌─────────┬──────────────────────┬─────────┐
//! │ guard   │ payload (size bytes) │ guard   │
//! └─────────┴──────────────────────┴─────────┘
//!           ▲ pointer handed out
//! ```
//!
//! The tracking record of a block lives in a separate block of the same heap.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    env::{DefaultEnvironment, Environment, Severity, TaskId},
    error::TrackerError,
    tracker::{Allocation, DeviceAllocator, DeviceConfig, MemStats},
};

mod env;
mod error;
mod table;
mod tracker;

/// Number of buckets in a device's allocation table.
pub const HASH_SIZE: usize = 64;
const _: () = assert!(HASH_SIZE.is_power_of_two());

/// Bytes of guard fill on each side of a tracked block.
pub const GUARD_SIZE: usize = 8;

/// Byte value the guards are filled with.
pub const GUARD_FILL: u8 = 0x5a;
