//! errno plumbing for the interception layer

/// Read the calling thread's errno.
#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Set the calling thread's errno.
#[inline]
pub(crate) fn set_errno(v: i32) {
    unsafe {
        *libc::__errno_location() = v;
    }
}
