use derive_more::IsVariant;
use snafu::Snafu;
use snafu_utils::{Locate, Location};

/// Failures reported by [`Arena`](crate::Arena) and [`Heap`](crate::Heap).
#[derive(Debug, Snafu, IsVariant)]
#[snafu(visibility(pub(crate)))]
pub enum HeapError {
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("out of memory: no free node fits a {size}-byte request"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The node behind a block does not carry a plausible "allocated"
    /// header. Heap bookkeeping was already damaged; nothing is repaired.
    #[snafu(display("heap metadata corrupted at offset {offset:#x}"))]
    Corrupted {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Locate for HeapError {
    fn location(&self) -> Location {
        match self {
            Self::InvalidArgument { location, .. }
            | Self::OutOfMemory { location, .. }
            | Self::Corrupted { location, .. } => *location,
        }
    }
}
