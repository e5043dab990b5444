//! Fiber stack allocation
//!
//! Each fiber owns one mmap'd stack with a PROT_NONE guard page at the low
//! end, so overflow faults instead of silently corrupting a neighbor.

use spindle_core::{RtError, RtResult, env_get};

/// Default fiber stack size (overridable per fiber, or process-wide via
/// `SPINDLE_STACK_SIZE`).
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Resolve the stack size for a new fiber: explicit request wins, then the
/// env override, then the default.
pub fn resolve_stack_size(requested: usize) -> usize {
    if requested != 0 {
        return requested;
    }
    env_get("SPINDLE_STACK_SIZE", DEFAULT_STACK_SIZE)
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned, guard-paged stack region. Stacks grow downward: `top()` is the
/// initial stack pointer.
pub struct Stack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

// The mapping is plain anonymous memory; ownership moves with the Stack.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack of at least `size` usable bytes plus one guard page.
    pub fn alloc(size: usize) -> RtResult<Stack> {
        let page = page_size();
        // Round usable space up to whole pages; guard page sits below it.
        let usable = size.div_ceil(page) * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RtError::StackAlloc);
        }

        // Low page becomes the guard
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rc != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(RtError::StackAlloc);
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
            usable,
        })
    }

    /// Highest address of the stack; the initial stack pointer.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (excluding the guard page).
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}
