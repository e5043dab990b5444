//! Stackful fibers
//!
//! A fiber is a user-level task with its own stack and saved register
//! frame, switched cooperatively. Every OS thread lazily synthesizes a
//! *thread-main* fiber for its original stack on the first
//! [`Fiber::current`] call; child fibers yield back either to that
//! thread-main fiber or to the thread's *scheduler fiber* (the dispatch
//! loop), selected at construction via `runs_under_scheduler`.
//!
//! A suspended fiber may be resumed on a different OS thread: the stack
//! and context travel with the `Arc<Fiber>`, and the partner to yield to
//! is re-read from the resuming thread's TLS.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use spindle_core::{AtomicFiberState, FiberId, FiberState, RtResult, kerror};

use crate::arch;
use crate::stack::{Stack, resolve_stack_size};

type EntryFn = Box<dyn FnOnce() + Send>;

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's main fiber (the OS thread's original stack)
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's scheduler fiber; defaults to the main fiber
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful cooperative task.
pub struct Fiber {
    id: FiberId,
    state: AtomicFiberState,
    ctx: std::cell::UnsafeCell<arch::Context>,
    stack: Option<Stack>,
    entry: std::cell::UnsafeCell<Option<EntryFn>>,
    runs_under_scheduler: bool,
    /// Serializes resume against concurrent manipulation; the dispatch
    /// loop holds this across the whole execution slice.
    resume_lock: Mutex<()>,
}

// Safety: `ctx` and `entry` are only touched by the thread that currently
// owns the execution slice. Resume is serialized by `resume_lock`, and a
// suspended fiber's frame is only read by the next resumer after the
// suspending switch has completed (the switch itself publishes the frame).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a child fiber that will run `entry` once resumed.
    ///
    /// `stack_size` of 0 selects the default (128 KiB, or
    /// `SPINDLE_STACK_SIZE`). With `runs_under_scheduler` set, `yield`
    /// transfers to the thread's scheduler fiber instead of its main
    /// fiber.
    pub fn new<F>(entry: F, stack_size: usize, runs_under_scheduler: bool) -> RtResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = Stack::alloc(resolve_stack_size(stack_size))?;
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicFiberState::new(FiberState::Ready),
            ctx: std::cell::UnsafeCell::new(arch::Context::zeroed()),
            stack: Some(stack),
            entry: std::cell::UnsafeCell::new(Some(Box::new(entry))),
            runs_under_scheduler,
            resume_lock: Mutex::new(()),
        });
        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_main as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        Ok(fiber)
    }

    /// Synthesize the calling thread's current execution as a fiber.
    fn new_main() -> Arc<Fiber> {
        Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicFiberState::new(FiberState::Running),
            ctx: std::cell::UnsafeCell::new(arch::Context::zeroed()),
            stack: None,
            entry: std::cell::UnsafeCell::new(None),
            runs_under_scheduler: false,
            resume_lock: Mutex::new(()),
        })
    }

    /// The fiber currently running on this thread.
    ///
    /// The first call on a thread synthesizes the thread-main fiber and
    /// installs it as both current and (by default) scheduler fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(cur) = CURRENT.with(|c| c.borrow().clone()) {
            return cur;
        }
        let main = Fiber::new_main();
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
        SCHEDULER_FIBER.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    /// The fiber currently running on this thread, without synthesizing
    /// a main fiber.
    pub fn maybe_current() -> Option<Arc<Fiber>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Id of the currently running fiber, if any.
    pub fn current_id() -> Option<FiberId> {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id))
    }

    /// Install `f` as this thread's scheduler fiber: the yield target for
    /// fibers created with `runs_under_scheduler`.
    pub fn set_scheduler_fiber(f: Arc<Fiber>) {
        SCHEDULER_FIBER.with(|c| *c.borrow_mut() = Some(f));
    }

    fn set_current(f: Arc<Fiber>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(f));
    }

    fn partner(&self) -> Arc<Fiber> {
        if self.runs_under_scheduler {
            SCHEDULER_FIBER
                .with(|c| c.borrow().clone())
                .expect("no scheduler fiber on this thread")
        } else {
            THREAD_MAIN
                .with(|c| c.borrow().clone())
                .expect("no main fiber on this thread")
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    pub(crate) fn resume_lock(&self) -> &Mutex<()> {
        &self.resume_lock
    }

    /// Resume this fiber on the calling thread.
    ///
    /// The caller's fiber is suspended until the callee yields or
    /// terminates. Must only be called on a READY fiber.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(
            self.state.get(),
            FiberState::Ready,
            "resume() on fiber {} in state {}",
            self.id,
            self.state.get()
        );
        self.state.set(FiberState::Running);

        let partner = self.partner();
        Fiber::set_current(self.clone());
        unsafe {
            arch::context_switch(partner.ctx.get(), self.ctx.get());
        }
    }

    /// Yield the calling fiber back to its partner (scheduler or thread
    /// main fiber). A RUNNING fiber becomes READY; TERM is preserved.
    pub fn yield_fiber(&self) {
        let st = self.state.get();
        assert!(
            st == FiberState::Running || st == FiberState::Term,
            "yield on fiber {} in state {}",
            self.id,
            st
        );
        if st == FiberState::Running {
            self.state.set(FiberState::Ready);
        }

        let partner = self.partner();
        Fiber::set_current(partner.clone());
        unsafe {
            arch::context_switch(self.ctx.get(), partner.ctx.get());
        }
    }

    /// Reinstall a terminated fiber with a new entry function, reusing its
    /// stack. The fiber becomes READY again.
    pub fn reset<F>(self: &Arc<Self>, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            self.state.get().is_term(),
            "reset() on fiber {} that has not terminated",
            self.id
        );
        let stack = self.stack.as_ref().expect("reset() on a thread-main fiber");
        unsafe {
            *self.entry.get() = Some(Box::new(entry));
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_main as usize,
                Arc::as_ptr(self) as usize,
            );
        }
        self.state.set(FiberState::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // Thread-main fibers are legitimately RUNNING when their thread
        // exits; a child fiber must never be dropped mid-slice.
        debug_assert!(
            self.stack.is_none() || self.state.get() != FiberState::Running,
            "fiber {} dropped while running",
            self.id
        );
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("runs_under_scheduler", &self.runs_under_scheduler)
            .finish()
    }
}

/// Yield the current fiber if there is one; otherwise yield the OS thread.
pub fn yield_now() {
    match Fiber::maybe_current() {
        Some(cur) if cur.stack.is_some() => cur.yield_fiber(),
        _ => std::thread::yield_now(),
    }
}

/// Entry point every child fiber starts in.
///
/// Runs the stored entry function under a panic guard, marks the fiber
/// TERM, drops the self-reference, and yields. Control never returns here
/// except through an erroneous resume of a TERM fiber.
extern "C" fn fiber_main(_arg: usize) -> ! {
    let cur = Fiber::current();

    let entry = unsafe { (*cur.entry.get()).take() };
    if let Some(f) = entry {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            kerror!("fiber {} panicked; terminating it", cur.id);
        }
    }

    cur.state.set(FiberState::Term);

    // Drop our own strong reference before the final switch so the
    // scheduler's handle is the last owner; the raw pointer stays valid
    // because the resumer still holds that handle.
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    unsafe {
        (*raw).yield_fiber();
    }
    unreachable!("terminated fiber was resumed");
}
