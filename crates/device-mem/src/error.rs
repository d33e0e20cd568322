use arena_heap::{BlockPtr, HeapError};
use snafu::Snafu;
use snafu_utils::{Locate, Location};

use crate::env::Severity;

/// Failures reported by a [`DeviceAllocator`](crate::DeviceAllocator).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TrackerError {
    #[snafu(display("invalid allocation size {size}"))]
    InvalidSize {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("device has no allocation table configured"))]
    NotConfigured {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("out of memory allocating {size} bytes"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
        source: HeapError,
    },
    /// The pointer is not in this device's table: never allocated here, or
    /// already freed. The arena was not touched.
    #[snafu(display("block {ptr} is not managed by this device"))]
    ForeignPointer {
        ptr: BlockPtr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("guard bytes around block {ptr} were overwritten"))]
    GuardOverwritten {
        ptr: BlockPtr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap operation on block {ptr} failed"))]
    Heap {
        ptr: BlockPtr,
        #[snafu(implicit)]
        location: Location,
        source: HeapError,
    },
    #[snafu(display("failed to release outstanding allocations after {released} blocks"))]
    ReleaseFailed {
        released: usize,
        #[snafu(implicit)]
        location: Location,
        source: HeapError,
    },
}

impl TrackerError {
    /// How loudly the failure is reported through the environment, if at all.
    #[must_use]
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Self::InvalidSize { .. } | Self::NotConfigured { .. } | Self::OutOfMemory { .. } => {
                None
            }
            Self::ForeignPointer { .. } => Some(Severity::Normal),
            Self::GuardOverwritten { .. } | Self::Heap { .. } | Self::ReleaseFailed { .. } => {
                Some(Severity::Serious)
            }
        }
    }

    #[must_use]
    pub fn is_serious(&self) -> bool {
        self.severity().is_some_and(|severity| severity.is_serious())
    }
}

impl Locate for TrackerError {
    fn location(&self) -> Location {
        match self {
            Self::InvalidSize { location, .. }
            | Self::NotConfigured { location }
            | Self::OutOfMemory { location, .. }
            | Self::ForeignPointer { location, .. }
            | Self::GuardOverwritten { location, .. }
            | Self::Heap { location, .. }
            | Self::ReleaseFailed { location, .. } => *location,
        }
    }
}
