//! Per-fd state
//!
//! [`FdContext`] is the per-file-descriptor record: which directions are
//! registered with the poller, the continuation to run per direction, and
//! the hook-layer bookkeeping (socketness, the user-visible vs kernel
//! non-blocking split, per-direction timeouts, closed flag).
//!
//! The [`FdManager`] singleton maps every user-visible fd to its context
//! process-wide; each I/O manager additionally keeps a dense cache of the
//! records it polls, indexed by raw fd. Slots grow geometrically and are
//! never shrunk: `close` drops the manager's mapping and the record is
//! recreated if the fd number is reused.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak};

use spindle_core::kwarn;
use spindle_runtime::fiber::Fiber;
use spindle_runtime::scheduler::{ANY_WORKER, ScheduleTask, Scheduler};

use crate::origin;
use crate::poller::{EVENT_READ, EVENT_WRITE};

/// Sentinel for "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// The continuation attached to one direction of an fd.
pub(crate) enum Continuation {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

/// One registered direction: who schedules the continuation, and what to
/// run when the direction fires.
pub(crate) struct EventSlot {
    pub scheduler: Weak<Scheduler>,
    pub cont: Continuation,
}

/// Registered-direction state; guarded by the per-fd mutex.
pub(crate) struct FdEvents {
    /// Union of registered [`EVENT_READ`] / [`EVENT_WRITE`] bits.
    pub mask: u32,
    pub read: Option<EventSlot>,
    pub write: Option<EventSlot>,
}

struct FdFlags {
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: bool,
    closed: bool,
    recv_timeout_ms: u64,
    send_timeout_ms: u64,
}

/// Per-file-descriptor record.
pub struct FdContext {
    fd: libc::c_int,
    events: Mutex<FdEvents>,
    flags: Mutex<FdFlags>,
}

impl FdContext {
    pub(crate) fn new(fd: libc::c_int) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            events: Mutex::new(FdEvents {
                mask: 0,
                read: None,
                write: None,
            }),
            flags: Mutex::new(FdFlags {
                is_socket: false,
                sys_nonblock: false,
                user_nonblock: false,
                closed: false,
                recv_timeout_ms: NO_TIMEOUT,
                send_timeout_ms: NO_TIMEOUT,
            }),
        })
    }

    /// Probe the fd and, for sockets, force kernel-side `O_NONBLOCK`
    /// while leaving the user-visible flag untouched.
    pub(crate) fn probe(&self) {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(self.fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut f = self.flags.lock().unwrap();
        f.is_socket = is_socket;
        if is_socket {
            let fcntl = origin::fcntl();
            let fl = unsafe { fcntl(self.fd, libc::F_GETFL, 0) };
            if fl >= 0 && fl & libc::O_NONBLOCK == 0 {
                unsafe { fcntl(self.fd, libc::F_SETFL, (fl | libc::O_NONBLOCK) as libc::c_ulong) };
            }
            f.sys_nonblock = true;
        }
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    pub(crate) fn events_lock(&self) -> MutexGuard<'_, FdEvents> {
        self.events.lock().unwrap()
    }

    pub fn is_socket(&self) -> bool {
        self.flags.lock().unwrap().is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.flags.lock().unwrap().closed
    }

    pub(crate) fn set_closed(&self) {
        self.flags.lock().unwrap().closed = true;
    }

    pub fn user_nonblock(&self) -> bool {
        self.flags.lock().unwrap().user_nonblock
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.flags.lock().unwrap().user_nonblock = v;
    }

    pub fn sys_nonblock(&self) -> bool {
        self.flags.lock().unwrap().sys_nonblock
    }

    /// Per-direction timeout; `kind` is `SO_RCVTIMEO` or `SO_SNDTIMEO`.
    pub fn timeout(&self, kind: libc::c_int) -> u64 {
        let f = self.flags.lock().unwrap();
        if kind == libc::SO_RCVTIMEO {
            f.recv_timeout_ms
        } else {
            f.send_timeout_ms
        }
    }

    pub fn set_timeout(&self, kind: libc::c_int, ms: u64) {
        let mut f = self.flags.lock().unwrap();
        if kind == libc::SO_RCVTIMEO {
            f.recv_timeout_ms = ms;
        } else {
            f.send_timeout_ms = ms;
        }
    }

    /// Fire one direction: clear its bit, hand the continuation to its
    /// owning scheduler, reset the slot. Caller holds the events lock and
    /// has already verified the bit is set.
    pub(crate) fn trigger_locked(&self, ev: &mut FdEvents, event: u32) {
        debug_assert!(event == EVENT_READ || event == EVENT_WRITE);
        assert!(ev.mask & event != 0, "trigger on unregistered direction");
        ev.mask &= !event;

        let slot = if event == EVENT_READ {
            ev.read.take()
        } else {
            ev.write.take()
        };
        let Some(slot) = slot else {
            return;
        };
        let Some(sched) = slot.scheduler.upgrade() else {
            kwarn!("fd {}: continuation dropped, owning scheduler is gone", self.fd);
            return;
        };
        match slot.cont {
            Continuation::Fiber(fiber) => sched.schedule_fiber(fiber),
            Continuation::Callback(cb) => sched.schedule(ScheduleTask::Callback(cb), ANY_WORKER),
        }
    }

    /// Count of populated continuation slots; equals the popcount of the
    /// registered mask by construction.
    pub fn registered_slots(&self) -> usize {
        let g = self.events.lock().unwrap();
        g.read.is_some() as usize + g.write.is_some() as usize
    }

    /// Union of registered direction bits.
    pub fn registered_mask(&self) -> u32 {
        self.events.lock().unwrap().mask
    }
}

/// Process-wide fd → context mapping shared by every I/O manager.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

static FD_MANAGER: OnceLock<FdManager> = OnceLock::new();

/// The process-wide fd manager.
pub fn fd_manager() -> &'static FdManager {
    FD_MANAGER.get_or_init(|| FdManager {
        slots: RwLock::new(Vec::new()),
    })
}

impl FdManager {
    /// Look up the context for `fd`, creating (and probing) one when
    /// `auto_create` is set.
    pub fn get(&self, fd: libc::c_int, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let new_len = (idx * 3 / 2 + 1).max(32);
            slots.resize(new_len, None);
        }
        if let Some(ctx) = &slots[idx] {
            return Some(ctx.clone());
        }
        let ctx = FdContext::new(fd);
        ctx.probe();
        slots[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Drop the mapping for `fd` (on close). The record is marked closed
    /// so in-flight waiters holding it observe `EBADF`.
    pub fn remove(&self, fd: libc::c_int) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.set_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_auto_create_and_remove() {
        let mgr = fd_manager();
        let mut fds = [0 as libc::c_int; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let (rd, wr) = (fds[0], fds[1]);

        assert!(mgr.get(rd, false).is_none());
        let ctx = mgr.get(rd, true).unwrap();
        assert_eq!(ctx.fd(), rd);
        assert!(!ctx.is_socket()); // pipes are not sockets
        assert!(!ctx.is_closed());

        // Same record on re-get
        let again = mgr.get(rd, false).unwrap();
        assert!(Arc::ptr_eq(&ctx, &again));

        mgr.remove(rd);
        assert!(ctx.is_closed());
        assert!(mgr.get(rd, false).is_none());

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_socket_probe_forces_nonblock() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = fd_manager().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let fl = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(fl & libc::O_NONBLOCK != 0);

        fd_manager().remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_timeouts_default_unset() {
        let mut fds = [0 as libc::c_int; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let ctx = fd_manager().get(fds[0], true).unwrap();
        assert_eq!(ctx.timeout(libc::SO_RCVTIMEO), NO_TIMEOUT);
        assert_eq!(ctx.timeout(libc::SO_SNDTIMEO), NO_TIMEOUT);
        ctx.set_timeout(libc::SO_RCVTIMEO, 250);
        assert_eq!(ctx.timeout(libc::SO_RCVTIMEO), 250);
        assert_eq!(ctx.timeout(libc::SO_SNDTIMEO), NO_TIMEOUT);
        fd_manager().remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
