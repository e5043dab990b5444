//! # spindle-runtime
//!
//! The scheduling half of the spindle fiber runtime:
//!
//! - stackful fibers with arch-specific context switching
//! - guard-paged fiber stacks
//! - named worker threads with a synchronized start handshake
//! - the dispatch loop / scheduler with its hook protocol
//! - the deadline-ordered timer manager
//!
//! The I/O half (epoll reactor, fd contexts, syscall interception) lives
//! in `spindle-io` and plugs in through [`scheduler::SchedulerHooks`].

pub mod arch;
pub mod fiber;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;

pub use fiber::{Fiber, yield_now};
pub use scheduler::{ANY_WORKER, ScheduleTask, Scheduler, SchedulerHooks};
pub use stack::DEFAULT_STACK_SIZE;
pub use timer::{NO_TIMER, Timer, TimerCallback, TimerManager};
