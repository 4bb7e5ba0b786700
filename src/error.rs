//! Error types and the process-wide error indicator.

use core::sync::atomic::{AtomicU8, Ordering};

/// Recoverable allocator failures.
///
/// Internal, `Result`-returning helpers (region growth, alignment
/// validation) use this type. The public C-ABI-shaped surface
/// (`malloc`/`free`/`realloc`/`memalign`) collapses it to a null pointer
/// plus [`set_errno`], matching the contract in the external interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The managed region could not be grown further.
    #[error("out of memory")]
    OutOfMemory,
    /// `memalign`'s `align` argument was not a power of two, or was smaller
    /// than `Q / 2`.
    #[error("invalid alignment")]
    InvalidAlignment,
}

/// Values the process-wide error indicator can hold.
///
/// Mirrors the three-valued `errno` surface a malloc implementation
/// exposes: no error, out of memory, or an invalid argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Errno {
    /// No error is currently indicated.
    Success = 0,
    /// Set after an allocation could not be satisfied by growing the region.
    NoMemory = 1,
    /// Set after `memalign` was called with a bad alignment argument.
    InvalidArgument = 2,
}

static ERRNO: AtomicU8 = AtomicU8::new(Errno::Success as u8);

/// Read the process-wide error indicator.
///
/// Successful operations never modify it; it only ever reflects the most
/// recent recoverable failure.
#[must_use]
pub fn errno() -> Errno {
    match ERRNO.load(Ordering::Relaxed) {
        1 => Errno::NoMemory,
        2 => Errno::InvalidArgument,
        _ => Errno::Success,
    }
}

/// Set the process-wide error indicator. Never called on a success path.
pub(crate) fn set_errno(e: Errno) {
    ERRNO.store(e as u8, Ordering::Relaxed);
}

pub(crate) fn set_from(err: AllocError) {
    set_errno(match err {
        AllocError::OutOfMemory => Errno::NoMemory,
        AllocError::InvalidAlignment => Errno::InvalidArgument,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clean() {
        assert_eq!(errno(), Errno::Success);
    }

    #[test]
    fn round_trips_through_set_from() {
        set_from(AllocError::OutOfMemory);
        assert_eq!(errno(), Errno::NoMemory);
        set_from(AllocError::InvalidAlignment);
        assert_eq!(errno(), Errno::InvalidArgument);
        set_errno(Errno::Success);
    }
}
