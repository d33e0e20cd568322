//! Error plumbing shared by the heap crates.
//!
//! - [`Location`] records the source location where an error was created. Use
//!   it as a `#[snafu(implicit)]` field.
//! - [`Locate`] gives access to that location from an error value.
//! - [`Report`] renders an error, its location and its chain of sources.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::{error::Error, fmt};

use snafu::GenerateImplicitData;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors that know where they were raised.
pub trait Locate {
    fn location(&self) -> Location;
}

impl<T> Locate for &T
where
    T: Locate + ?Sized,
{
    fn location(&self) -> Location {
        (**self).location()
    }
}

/// Multi-line rendering of an error for diagnostics output.
///
/// ```text
/// Error: failed to release outstanding allocations
///   at crates/device-mem/src/tracker.rs:310:14
///
/// Caused by:
///    0: heap metadata corrupted at offset 0x60
/// ```
pub struct Report<E> {
    error: E,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + Locate,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + Locate,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        write!(f, "  at {}", self.error.location())?;
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f)?;
            write!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f)?;
            write!(f, "{index:4}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    #[must_use]
    pub fn new(error: E) -> Self {
        Self { error }
    }
}
