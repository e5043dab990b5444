//! Architecture-specific context switching
//!
//! Each backend exposes the same three items: a callee-saved register
//! frame (`Context`), `init_context` to point a fresh frame at the fiber
//! trampoline, and the naked `context_switch` primitive. All unsafe
//! register-level code lives here.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{Context, context_switch, init_context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{Context, context_switch, init_context};
    } else {
        compile_error!("spindle: unsupported architecture");
    }
}
