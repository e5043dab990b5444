//! # spindle-io
//!
//! The I/O half of the spindle fiber runtime:
//!
//! - per-fd context records and the process-wide fd manager
//! - the epoll-backed I/O manager driving each worker's idle fiber
//! - the syscall-interception layer (explicit cooperative wrappers; the
//!   `spindle-preload` crate exports them as C symbol overrides)

mod errno;
pub mod fd;
pub mod hook;
pub mod iomanager;
mod origin;
pub mod poller;

pub use fd::{FdContext, FdManager, NO_TIMEOUT, fd_manager};
pub use hook::{hook_enabled, set_hook_enabled};
pub use iomanager::IoManager;
pub use poller::{EVENT_READ, EVENT_WRITE};
