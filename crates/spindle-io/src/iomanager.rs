//! The I/O manager
//!
//! Couples a [`Scheduler`] and a [`TimerManager`] to an edge-triggered
//! epoll poller. Each worker's idle fiber blocks in `epoll_wait`, bounded
//! by the nearest timer deadline, then feeds expired timer callbacks and
//! ready-fd continuations back into the task queue.
//!
//! Registrations are one-shot from the caller's perspective: when a
//! direction fires, its bit is cleared and the continuation runs exactly
//! once; whoever wants another notification re-registers (which is what
//! the hook layer's retry loop does).

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use spindle_core::{RtError, RtResult, kdebug, kerror};
use spindle_runtime::fiber::Fiber;
use spindle_runtime::scheduler::{Scheduler, SchedulerHooks};
use spindle_runtime::timer::TimerManager;

use crate::fd::{Continuation, EventSlot, FdContext, fd_manager};
use crate::hook;
use crate::origin;
use crate::poller::{EDGE_TRIGGERED, EVENT_READ, EVENT_WRITE, Poller};

/// User-data word marking the self-pipe registration.
const TICKLE_TOKEN: u64 = 0;

const MAX_EVENTS: usize = 256;

/// Ceiling on one poller wait, so stop requests are noticed even with a
/// far-off timer front.
const MAX_TIMEOUT_MS: u64 = 5000;

thread_local! {
    static CURRENT_IOMANAGER: RefCell<Weak<IoManager>> = const { RefCell::new(Weak::new()) };
}

pub struct IoManager {
    weak_self: OnceLock<Weak<IoManager>>,
    sched: Arc<Scheduler>,
    timers: TimerManager,
    poller: Poller,
    /// Self-pipe: [read end, write end]. One tickle byte per wakeup.
    tickle_fds: [libc::c_int; 2],
    /// Outstanding readiness registrations across all fds.
    pending_events: AtomicUsize,
    /// Dense cache of the process-wide fd records, indexed by raw fd;
    /// grows by ~1.5x, never shrinks. Registrations point epoll's
    /// user-data word at these records.
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl IoManager {
    /// Build and start an I/O manager with `threads` workers.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RtResult<Arc<IoManager>> {
        let sched = Scheduler::new(threads, use_caller, name)?;
        let poller = Poller::new()?;

        let mut pipe_fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(RtError::Poller(crate::errno::errno()));
        }
        poller.add(pipe_fds[0], EVENT_READ | EDGE_TRIGGERED, TICKLE_TOKEN)?;

        let iom = Arc::new(IoManager {
            weak_self: OnceLock::new(),
            sched,
            timers: TimerManager::new(),
            poller,
            tickle_fds: pipe_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
        });
        let weak = Arc::downgrade(&iom);
        iom.weak_self.set(weak.clone()).ok();
        iom.sched.set_hooks(weak.clone());

        let front = weak.clone();
        iom.timers.set_front_hook(move || {
            if let Some(m) = front.upgrade() {
                m.tickle();
            }
        });

        iom.grow_contexts(32);
        IoManager::set_this(&iom);
        iom.sched.start()?;
        Ok(iom)
    }

    /// The I/O manager owning the calling thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOMANAGER.with(|c| c.borrow().upgrade())
    }

    fn set_this(iom: &Arc<IoManager>) {
        CURRENT_IOMANAGER.with(|c| *c.borrow_mut() = Arc::downgrade(iom));
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    #[inline]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    #[inline]
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Request shutdown and join all workers. Forbidden from a worker of
    /// this manager; with `use_caller`, must run on the constructing
    /// thread.
    pub fn stop(&self) {
        self.sched.stop();
    }

    fn grow_contexts(&self, size: usize) {
        let mut slots = self.fd_contexts.write().unwrap();
        if slots.len() < size {
            slots.resize(size, None);
        }
    }

    /// The process-wide record for `fd`, cached in this manager's dense
    /// table. One `FdContext` per fd exists in the process: the fd
    /// manager's. A cached record that was closed means the fd number was
    /// reused, so the slot rebinds to the singleton's current record.
    fn context_for(&self, fd: libc::c_int) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let slots = self.fd_contexts.read().unwrap();
            if let Some(Some(ctx)) = slots.get(idx) {
                if !ctx.is_closed() {
                    return ctx.clone();
                }
            }
        }

        let ctx = fd_manager()
            .get(fd, true)
            .expect("fd-context lookup on negative fd");
        let mut slots = self.fd_contexts.write().unwrap();
        if idx >= slots.len() {
            let new_len = (idx * 3 / 2 + 1).max(32);
            slots.resize(new_len, None);
        }
        slots[idx] = Some(ctx.clone());
        ctx
    }

    /// Register interest in one direction of `fd`.
    ///
    /// With no callback, the current fiber is attached and resumed when
    /// the direction fires. One registrant per direction: a second
    /// registration fails with [`RtError::EventExists`].
    pub fn add_event(
        &self,
        fd: libc::c_int,
        event: u32,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> RtResult<()> {
        debug_assert!(event == EVENT_READ || event == EVENT_WRITE);
        let ctx = self.context_for(fd);
        let mut ev = ctx.events_lock();

        if ev.mask & event != 0 {
            return Err(RtError::EventExists);
        }

        let data = Arc::as_ptr(&ctx) as u64;
        let union = ev.mask | event | EDGE_TRIGGERED;
        let res = if ev.mask != 0 {
            self.poller.modify(fd, union, data)
        } else {
            self.poller.add(fd, union, data)
        };
        if let Err(e) = res {
            kerror!("add_event(fd={}, ev={:#x}) poller failure: {}", fd, event, e);
            return Err(e);
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        ev.mask |= event;

        let scheduler = Scheduler::current().unwrap_or_else(|| self.sched.clone());
        let cont = match cb {
            Some(cb) => Continuation::Callback(cb),
            None => {
                let fiber = Fiber::current();
                debug_assert_eq!(fiber.state(), spindle_core::FiberState::Running);
                Continuation::Fiber(fiber)
            }
        };
        let slot = EventSlot {
            scheduler: Arc::downgrade(&scheduler),
            cont,
        };
        if event == EVENT_READ {
            debug_assert!(ev.read.is_none());
            ev.read = Some(slot);
        } else {
            debug_assert!(ev.write.is_none());
            ev.write = Some(slot);
        }
        Ok(())
    }

    /// Convenience: register a callback continuation.
    pub fn add_event_cb<F>(&self, fd: libc::c_int, event: u32, cb: F) -> RtResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event(fd, event, Some(Box::new(cb)))
    }

    /// Remove a registration without firing its continuation.
    pub fn del_event(&self, fd: libc::c_int, event: u32) -> bool {
        let ctx = self.context_for(fd);
        let mut ev = ctx.events_lock();
        if ev.mask & event == 0 {
            return false;
        }

        let left = (ev.mask & !event) | EDGE_TRIGGERED;
        let data = Arc::as_ptr(&ctx) as u64;
        let res = if left != EDGE_TRIGGERED {
            self.poller.modify(fd, left, data)
        } else {
            self.poller.delete(fd)
        };
        if let Err(e) = res {
            kerror!("del_event(fd={}, ev={:#x}) poller failure: {}", fd, event, e);
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        ev.mask &= !event;
        if event == EVENT_READ {
            ev.read = None;
        } else {
            ev.write = None;
        }
        true
    }

    /// Remove a registration and fire its continuation once.
    pub fn cancel_event(&self, fd: libc::c_int, event: u32) -> bool {
        let ctx = self.context_for(fd);
        let mut ev = ctx.events_lock();
        if ev.mask & event == 0 {
            return false;
        }

        let left = (ev.mask & !event) | EDGE_TRIGGERED;
        let data = Arc::as_ptr(&ctx) as u64;
        let res = if left != EDGE_TRIGGERED {
            self.poller.modify(fd, left, data)
        } else {
            self.poller.delete(fd)
        };
        if let Err(e) = res {
            kerror!("cancel_event(fd={}, ev={:#x}) poller failure: {}", fd, event, e);
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        ctx.trigger_locked(&mut ev, event);
        true
    }

    /// Drop the fd from the poller entirely, firing both continuations.
    pub fn cancel_all(&self, fd: libc::c_int) -> bool {
        let ctx = self.context_for(fd);
        let mut ev = ctx.events_lock();
        if ev.mask == 0 {
            return false;
        }

        if let Err(e) = self.poller.delete(fd) {
            kerror!("cancel_all(fd={}) poller failure: {}", fd, e);
        }

        if ev.mask & EVENT_READ != 0 {
            ctx.trigger_locked(&mut ev, EVENT_READ);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if ev.mask & EVENT_WRITE != 0 {
            ctx.trigger_locked(&mut ev, EVENT_WRITE);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert_eq!(ev.mask, 0);
        true
    }

    /// Wake one idle worker out of its poller wait.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        unsafe {
            origin::write()(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                origin::read()(self.tickle_fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Stop predicate: no timers, no outstanding registrations, and the
    /// scheduler's own stop condition.
    fn stop_pred(&self) -> bool {
        !self.timers.has_timers()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    /// Idle fiber body: the readiness-poll loop.
    fn idle_loop(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.stop_pred() {
                kdebug!("{}: idle loop exiting", self.sched.name());
                break;
            }

            let n = loop {
                let timeout = self.timers.get_next_delay().min(MAX_TIMEOUT_MS);
                match self.poller.wait(&mut events, timeout as libc::c_int) {
                    Ok(n) => break n,
                    Err(libc::EINTR) => continue,
                    Err(e) => {
                        kerror!("{}: epoll_wait failed: errno {}", self.sched.name(), e);
                        break 0;
                    }
                }
            };

            let mut cbs = Vec::new();
            self.timers.harvest_expired(&mut cbs);
            for cb in cbs {
                self.sched.schedule_callback(move || cb());
            }

            for ev in &events[..n] {
                let data = ev.u64;
                if data == TICKLE_TOKEN {
                    self.drain_tickle_pipe();
                    continue;
                }

                // Registered fds carry a pointer to their context record;
                // records live as long as this manager, so the borrow is
                // sound.
                let ctx = unsafe { &*(data as *const FdContext) };
                let mut guard = ctx.events_lock();

                let mut kernel = ev.events;
                if kernel & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    kernel |= (EVENT_READ | EVENT_WRITE) & guard.mask;
                }
                let real = kernel & (EVENT_READ | EVENT_WRITE) & guard.mask;
                if real == 0 {
                    continue;
                }

                let left = (guard.mask & !real) | EDGE_TRIGGERED;
                let res = if left != EDGE_TRIGGERED {
                    self.poller.modify(ctx.fd(), left, data)
                } else {
                    self.poller.delete(ctx.fd())
                };
                if let Err(e) = res {
                    kerror!("idle: re-register fd {} failed: {}", ctx.fd(), e);
                    continue;
                }

                if real & EVENT_READ != 0 {
                    ctx.trigger_locked(&mut guard, EVENT_READ);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if real & EVENT_WRITE != 0 {
                    ctx.trigger_locked(&mut guard, EVENT_WRITE);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Hand control back; the dispatcher returns here once the
            // task queue drains again.
            Fiber::current().yield_fiber();
        }
    }
}

impl SchedulerHooks for IoManager {
    fn thread_begin(&self) {
        if let Some(weak) = self.weak_self.get() {
            CURRENT_IOMANAGER.with(|c| *c.borrow_mut() = weak.clone());
        }
        hook::set_hook_enabled(true);
    }

    fn tickle(&self) {
        IoManager::tickle(self);
    }

    fn idle(&self) {
        self.idle_loop();
    }

    fn stopping(&self) -> bool {
        self.stop_pred()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
