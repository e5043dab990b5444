//! # spindle
//!
//! A userspace M:N fiber runtime for Linux: cooperative stackful fibers
//! multiplexed across a fixed pool of OS threads, with an edge-triggered
//! epoll reactor, a deadline-ordered timer set, and a syscall-interception
//! layer that turns blocking socket calls and sleeps into cooperative
//! waits.
//!
//! ## Quick start
//!
//! ```no_run
//! use spindle::IoManager;
//!
//! let iom = IoManager::new(4, false, "app").unwrap();
//! iom.scheduler().schedule_callback(|| {
//!     // Runs inside a fiber on a worker thread with hooking enabled:
//!     // spindle::hook::sleep(1) suspends this fiber for a second
//!     // without blocking the worker.
//!     spindle::hook::sleep(1);
//! });
//! // ... later
//! iom.stop();
//! ```
//!
//! Programs that cannot call the hook API directly can preload
//! `libspindle_preload.so` to intercept the libc symbols process-wide.

// Core primitives
pub use spindle_core::{
    FiberId, FiberState, LogLevel, RtError, RtResult, env_get, env_get_bool, env_is_set,
};

// Logging macros
pub use spindle_core::{kdebug, kerror, kinfo, ktrace, kwarn};

// Fibers, scheduler, timers
pub use spindle_runtime::{
    ANY_WORKER, DEFAULT_STACK_SIZE, Fiber, NO_TIMER, ScheduleTask, Scheduler, SchedulerHooks,
    Timer, TimerCallback, TimerManager, yield_now,
};

// I/O manager and interception layer
pub use spindle_io::{
    EVENT_READ, EVENT_WRITE, FdContext, FdManager, IoManager, NO_TIMEOUT, fd_manager,
    hook_enabled, set_hook_enabled,
};

pub use spindle_io::hook;
