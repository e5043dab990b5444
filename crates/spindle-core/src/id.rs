//! Fiber identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a fiber.
///
/// Ids are allocated from a process-wide monotonically increasing 64-bit
/// counter and are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

impl FiberId {
    /// Allocate the next fiber id.
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increase() {
        let a = FiberId::next();
        let b = FiberId::next();
        let c = FiberId::next();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_display() {
        let id = FiberId::next();
        assert_eq!(format!("{}", id), format!("{}", id.as_u64()));
    }
}
