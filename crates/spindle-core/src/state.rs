//! Fiber state machine

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of a fiber.
///
/// A fiber starts `Ready` (child) or `Running` (the synthesized thread-main
/// fiber), bounces between `Ready` and `Running` across yields/resumes, and
/// ends in `Term` once its entry function returns. `Term` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Runnable, waiting to be resumed
    Ready = 0,

    /// Currently executing on some OS thread
    Running = 1,

    /// Entry function finished; never resumed again
    Term = 2,
}

impl FiberState {
    #[inline]
    pub const fn is_term(self) -> bool {
        matches!(self, FiberState::Term)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(s: FiberState) -> u8 {
        s as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Ready => write!(f, "READY"),
            FiberState::Running => write!(f, "RUNNING"),
            FiberState::Term => write!(f, "TERM"),
        }
    }
}

/// Atomic cell holding a [`FiberState`].
///
/// Fibers migrate between OS threads, so the state must be readable from
/// any thread without holding the resume lock.
pub struct AtomicFiberState(AtomicU8);

impl AtomicFiberState {
    #[inline]
    pub const fn new(state: FiberState) -> Self {
        AtomicFiberState(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn get(&self) -> FiberState {
        FiberState::from(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: FiberState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl fmt::Debug for AtomicFiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.get())
    }
}
