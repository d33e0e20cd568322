//! Hooks into the host environment.

use core::fmt;

use derive_more::{Display, IsVariant};
use log::{error, warn};

/// Identity of the execution context that made an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("task {_0}")]
pub struct TaskId(pub u32);

impl TaskId {
    pub const UNKNOWN: Self = Self(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IsVariant)]
pub enum Severity {
    /// Worth telling someone about; the allocator state is fine.
    Normal,
    /// Heap bookkeeping is compromised or a teardown failed.
    Serious,
}

/// Services a [`DeviceAllocator`](crate::DeviceAllocator) needs from its host.
pub trait Environment {
    /// Identity of the currently running task, recorded with each allocation.
    fn current_task_id(&self) -> TaskId {
        TaskId::UNKNOWN
    }

    /// Diagnostics sink.
    fn report(&self, severity: Severity, message: fmt::Arguments<'_>) {
        match severity {
            Severity::Normal => warn!("mem: {message}"),
            Severity::Serious => error!("mem: {message}"),
        }
    }
}

impl<E> Environment for &E
where
    E: Environment + ?Sized,
{
    fn current_task_id(&self) -> TaskId {
        (**self).current_task_id()
    }

    fn report(&self, severity: Severity, message: fmt::Arguments<'_>) {
        (**self).report(severity, message);
    }
}

/// Reports through the `log` facade and attributes every allocation to
/// [`TaskId::UNKNOWN`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEnvironment;

impl Environment for DefaultEnvironment {}
