//! Kernel-style logging macros for spindle
//!
//! Thread-safe, optionally-flushing stderr output, configured from the
//! environment. Deliberately free of locks on the disabled path: the level
//! check is a single atomic load.
//!
//! # Environment Variables
//!
//! - `SPINDLE_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace
//!   (or 0..5); default info
//! - `SPINDLE_FLUSH_EPRINT=1` - flush stderr after each line (useful when
//!   debugging crashes in context-switch code)

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, lowest to most verbose
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from environment variables.
///
/// Called automatically on first use; call explicitly for deterministic
/// startup ordering.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("SPINDLE_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("SPINDLE_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
}

/// Current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Set flush mode programmatically
pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Emit one log line if `level` is enabled. Prefer the macros.
pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level > log_level() {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "{} {}", level.prefix(), args);
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Trace, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_set_level() {
        set_log_level(LogLevel::Warn);
        assert_eq!(log_level(), LogLevel::Warn);
        // below-threshold logging is a no-op, not a panic
        crate::kdebug!("not printed {}", 1);
        set_log_level(LogLevel::Info);
    }
}
