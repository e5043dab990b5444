//! Syscall interception
//!
//! Cooperative versions of the blocking libc calls. Each function keeps
//! the C signature and errno contract of its original; with hooking
//! disabled on the calling thread (the default) every call passes straight
//! through to the next symbol.
//!
//! With hooking enabled (I/O manager workers enable it on entry), a call
//! that would block instead registers readiness interest linking back to
//! the current fiber, optionally arms a condition timer from the fd's
//! configured timeout, and yields. The fiber resumes when the kernel
//! reports readiness, the timeout fires (`ETIMEDOUT`), or the fd is closed
//! out from under it.
//!
//! This module is the explicit-wrapper surface; `spindle-preload` exports
//! the same functions as `#[no_mangle]` C symbols for LD_PRELOAD use.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};

use spindle_core::kerror;
use spindle_runtime::fiber::Fiber;
use spindle_runtime::timer::TimerCallback;

use crate::errno::{errno, set_errno};
use crate::fd::{NO_TIMEOUT, fd_manager};
use crate::iomanager::IoManager;
use crate::origin;
use crate::poller::{EVENT_READ, EVENT_WRITE};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread redirects blocking calls into the runtime.
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Enable or disable redirection for the calling thread.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

/// Process-wide default timeout for hooked `connect`, in ms.
/// `u64::MAX` = wait indefinitely. A per-fd `SO_SNDTIMEO` overrides it.
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(NO_TIMEOUT);

pub fn set_connect_timeout_ms(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Relaxed);
}

/// Per-wait cancellation record shared between the waiter and its timer.
/// The timer holds only a weak reference, so a wait that completes first
/// neutralizes a late firing.
#[derive(Default)]
struct WaitState {
    cancelled: AtomicI32,
}

/// Arm a condition timer that cancels `event` on `fd` after `timeout_ms`.
fn arm_wait_timer(
    iom: &Arc<IoManager>,
    fd: c_int,
    event: u32,
    timeout_ms: u64,
    state: &Arc<WaitState>,
) -> Option<Arc<spindle_runtime::timer::Timer>> {
    if timeout_ms == NO_TIMEOUT {
        return None;
    }
    let winfo = Arc::downgrade(state);
    let weak_iom = Arc::downgrade(iom);
    let cb: TimerCallback = Arc::new(move || {
        let Some(state) = winfo.upgrade() else {
            return;
        };
        if state.cancelled.load(Ordering::SeqCst) != 0 {
            return;
        }
        state.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
        if let Some(iom) = weak_iom.upgrade() {
            iom.cancel_event(fd, event);
        }
    });
    Some(
        iom.timers()
            .add_condition_timer(timeout_ms, cb, Arc::downgrade(state), false),
    )
}

/// Shared retry loop for the read/write families.
///
/// `fun` invokes the original syscall with its captured arguments;
/// `timeout_kind` selects which per-fd timeout applies (`SO_RCVTIMEO` or
/// `SO_SNDTIMEO`).
fn do_io<F>(fd: c_int, name: &str, event: u32, timeout_kind: c_int, fun: F) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !hook_enabled() {
        return fun();
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return fun();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return fun();
    }

    let timeout_ms = ctx.timeout(timeout_kind);
    let state = Arc::new(WaitState::default());

    loop {
        let mut n = fun();
        while n == -1 && errno() == libc::EINTR {
            n = fun();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block: park this fiber until the direction is ready.
        let Some(iom) = IoManager::current() else {
            return n;
        };
        let timer = arm_wait_timer(&iom, fd, event, timeout_ms, &state);

        if let Err(e) = iom.add_event(fd, event, None) {
            kerror!("{}: add_event(fd={}, ev={:#x}) failed: {}", name, fd, event, e);
            if let Some(t) = timer {
                t.cancel();
            }
            return -1;
        }

        Fiber::current().yield_fiber();

        if let Some(t) = timer {
            t.cancel();
        }
        let cancelled = state.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Readiness reported: retry the raw call.
    }
}

// ── sleep family ──

pub fn sleep(seconds: c_uint) -> c_uint {
    if !hook_enabled() {
        return unsafe { origin::sleep()(seconds) };
    }
    let Some(iom) = IoManager::current() else {
        return unsafe { origin::sleep()(seconds) };
    };
    sleep_ms_cooperative(&iom, seconds as u64 * 1000);
    0
}

pub fn usleep(usec: libc::useconds_t) -> c_int {
    if !hook_enabled() {
        return unsafe { origin::usleep()(usec) };
    }
    let Some(iom) = IoManager::current() else {
        return unsafe { origin::usleep()(usec) };
    };
    sleep_ms_cooperative(&iom, usec as u64 / 1000);
    0
}

pub fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !hook_enabled() {
        return unsafe { origin::nanosleep()(req, rem) };
    }
    if req.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    let Some(iom) = IoManager::current() else {
        return unsafe { origin::nanosleep()(req, rem) };
    };
    let ms = unsafe { (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000 };
    sleep_ms_cooperative(&iom, ms);
    0
}

/// Arm a one-shot timer that reschedules the current fiber, then yield.
fn sleep_ms_cooperative(iom: &Arc<IoManager>, ms: u64) {
    let fiber = Fiber::current();
    let sched = iom.scheduler().clone();
    let waker = fiber.clone();
    iom.timers().add_timer(
        ms,
        Arc::new(move || sched.schedule_fiber(waker.clone())),
        false,
    );
    fiber.yield_fiber();
}

// ── socket creation and connection ──

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { origin::socket()(domain, ty, protocol) };
    }
    let fd = unsafe { origin::socket()(domain, ty, protocol) };
    if fd == -1 {
        return fd;
    }
    fd_manager().get(fd, true);
    fd
}

pub fn connect(sockfd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::Relaxed))
}

pub fn connect_with_timeout(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return unsafe { origin::connect()(sockfd, addr, addrlen) };
    }
    let Some(ctx) = fd_manager().get(sockfd, false) else {
        return unsafe { origin::connect()(sockfd, addr, addrlen) };
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { origin::connect()(sockfd, addr, addrlen) };
    }

    // Per-fd send timeout wins over the process-wide default.
    let per_fd = ctx.timeout(libc::SO_SNDTIMEO);
    let timeout_ms = if per_fd != NO_TIMEOUT { per_fd } else { timeout_ms };

    let n = unsafe { origin::connect()(sockfd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };
    let state = Arc::new(WaitState::default());
    let timer = arm_wait_timer(&iom, sockfd, EVENT_WRITE, timeout_ms, &state);

    match iom.add_event(sockfd, EVENT_WRITE, None) {
        Ok(()) => {
            Fiber::current().yield_fiber();
            if let Some(t) = timer {
                t.cancel();
            }
            let cancelled = state.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = timer {
                t.cancel();
            }
            kerror!("connect: add_event(fd={}, WRITE) failed: {}", sockfd, e);
        }
    }

    // The wait ended without a timeout: ask the kernel how it went.
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = unsafe {
        origin::getsockopt()(
            sockfd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

pub fn accept(sockfd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(sockfd, "accept", EVENT_READ, libc::SO_RCVTIMEO, || unsafe {
        origin::accept()(sockfd, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 && hook_enabled() {
        fd_manager().get(fd, true);
    }
    fd
}

// ── read family ──

pub fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", EVENT_READ, libc::SO_RCVTIMEO, || unsafe {
        origin::read()(fd, buf, count)
    })
}

pub fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", EVENT_READ, libc::SO_RCVTIMEO, || unsafe {
        origin::readv()(fd, iov, iovcnt)
    })
}

pub fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", EVENT_READ, libc::SO_RCVTIMEO, || unsafe {
        origin::recv()(sockfd, buf, len, flags)
    })
}

pub fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", EVENT_READ, libc::SO_RCVTIMEO, || unsafe {
        origin::recvfrom()(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

pub fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", EVENT_READ, libc::SO_RCVTIMEO, || unsafe {
        origin::recvmsg()(sockfd, msg, flags)
    })
}

// ── write family ──

pub fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", EVENT_WRITE, libc::SO_SNDTIMEO, || unsafe {
        origin::write()(fd, buf, count)
    })
}

pub fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", EVENT_WRITE, libc::SO_SNDTIMEO, || unsafe {
        origin::writev()(fd, iov, iovcnt)
    })
}

pub fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "send", EVENT_WRITE, libc::SO_SNDTIMEO, || unsafe {
        origin::send()(sockfd, buf, len, flags)
    })
}

pub fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, "sendto", EVENT_WRITE, libc::SO_SNDTIMEO, || unsafe {
        origin::sendto()(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

pub fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "sendmsg", EVENT_WRITE, libc::SO_SNDTIMEO, || unsafe {
        origin::sendmsg()(sockfd, msg, flags)
    })
}

// ── lifecycle and control ──

pub fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { origin::close()(fd) };
    }
    if fd_manager().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_manager().remove(fd);
    }
    unsafe { origin::close()(fd) }
}

/// Variadic in C; modeled with a fixed word-sized third argument, which
/// matches the ABI for every int- and pointer-argument command.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let Some(ctx) = fd_manager().get(fd, false) else {
                return unsafe { origin::fcntl()(fd, cmd, arg) };
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return unsafe { origin::fcntl()(fd, cmd, arg) };
            }
            let mut flags = arg as c_int;
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            // The kernel view of a hooked socket is always non-blocking.
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            unsafe { origin::fcntl()(fd, cmd, flags as c_ulong) }
        }
        libc::F_GETFL => {
            let flags = unsafe { origin::fcntl()(fd, cmd, 0) };
            let Some(ctx) = fd_manager().get(fd, false) else {
                return flags;
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return flags;
            }
            // Report the flag the user asked for, not the forced one.
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { origin::fcntl()(fd, cmd, arg) },
    }
}

pub fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let user_nonblock = unsafe { *(arg as *const c_int) } != 0;
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { origin::ioctl()(fd, request, arg) }
}

pub fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { origin::getsockopt()(sockfd, level, optname, optval, optlen) }
}

pub fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(ctx) = fd_manager().get(sockfd, false) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            ctx.set_timeout(optname, ms);
        }
    }
    unsafe { origin::setsockopt()(sockfd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_flag_is_per_thread() {
        assert!(!hook_enabled());
        set_hook_enabled(true);
        assert!(hook_enabled());
        let other = std::thread::spawn(|| hook_enabled()).join().unwrap();
        assert!(!other);
        set_hook_enabled(false);
    }

    #[test]
    fn test_passthrough_read_write() {
        // Hooks off: behaves exactly like libc on a plain pipe.
        let mut fds = [0 as c_int; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };

        let n = write(fds[1], b"hi".as_ptr() as *const c_void, 2);
        assert_eq!(n, 2);
        let mut buf = [0u8; 8];
        let n = read(fds[0], buf.as_mut_ptr() as *mut c_void, buf.len());
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");

        assert_eq!(close(fds[0]), 0);
        assert_eq!(close(fds[1]), 0);
    }

    #[test]
    fn test_fcntl_preserves_user_view() {
        set_hook_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // Kernel side is forced non-blocking, user view is blocking.
        let raw = unsafe { origin::fcntl()(fd, libc::F_GETFL, 0) };
        assert!(raw & libc::O_NONBLOCK != 0);
        assert_eq!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);

        // User opts into non-blocking: both views agree.
        let flags = fcntl(fd, libc::F_GETFL, 0) | libc::O_NONBLOCK;
        assert_eq!(fcntl(fd, libc::F_SETFL, flags as c_ulong), 0);
        assert!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0);

        assert_eq!(close(fd), 0);
        set_hook_enabled(false);
    }

    #[test]
    fn test_setsockopt_records_timeout() {
        set_hook_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        let rc = setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const c_void,
            std::mem::size_of::<libc::timeval>() as socklen_t,
        );
        assert_eq!(rc, 0);

        let ctx = fd_manager().get(fd, false).unwrap();
        assert_eq!(ctx.timeout(libc::SO_RCVTIMEO), 1500);
        assert_eq!(ctx.timeout(libc::SO_SNDTIMEO), NO_TIMEOUT);

        assert_eq!(close(fd), 0);
        set_hook_enabled(false);
    }
}
