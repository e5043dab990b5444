//! # spindle-core
//!
//! Leaf primitives shared by the spindle fiber runtime crates:
//!
//! - fiber ids and the fiber state machine
//! - error types
//! - env-var helpers
//! - kernel-style logging macros

pub mod env;
pub mod error;
pub mod id;
pub mod klog;
pub mod state;

pub use env::{env_get, env_get_bool, env_is_set};
pub use error::{RtError, RtResult};
pub use id::FiberId;
pub use klog::LogLevel;
pub use state::{AtomicFiberState, FiberState};
