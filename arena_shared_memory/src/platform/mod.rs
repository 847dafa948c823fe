//! Platform-specific primitives.
//!
//! Only POSIX shared memory is supported.

#[cfg(unix)]
mod linux;

#[cfg(unix)]
pub use linux::*;
