//! Error types for the spindle runtime

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors surfaced by runtime operations.
///
/// Syscall results that belong to the user (hooked I/O) are not reported
/// through this type; they keep the libc return/errno convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtError {
    /// Scheduler was already started
    AlreadyStarted,

    /// Scheduler was stopped; starting it again is forbidden
    Stopped,

    /// Fiber stack allocation failed
    StackAlloc,

    /// Worker thread could not be spawned
    ThreadSpawn,

    /// The readiness poller rejected an operation (carries errno)
    Poller(i32),

    /// An event is already registered for that fd and direction
    EventExists,
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::AlreadyStarted => write!(f, "scheduler already started"),
            RtError::Stopped => write!(f, "scheduler has been stopped"),
            RtError::StackAlloc => write!(f, "fiber stack allocation failed"),
            RtError::ThreadSpawn => write!(f, "worker thread spawn failed"),
            RtError::Poller(errno) => write!(f, "poller operation failed: errno {}", errno),
            RtError::EventExists => write!(f, "event already registered for this direction"),
        }
    }
}

impl std::error::Error for RtError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", RtError::EventExists),
            "event already registered for this direction"
        );
        assert_eq!(format!("{}", RtError::Poller(22)), "poller operation failed: errno 22");
    }
}
