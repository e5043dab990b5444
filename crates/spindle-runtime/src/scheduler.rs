//! Fiber scheduler
//!
//! M worker threads pull tasks (fibers or callbacks) from one
//! mutex-guarded queue; each worker runs the dispatch loop and falls back
//! to an *idle fiber* when the queue is empty. The outer I/O layer plugs
//! into the loop through the [`SchedulerHooks`] protocol instead of
//! inheritance: `tickle` wakes an idle worker, `idle` is the idle fiber
//! body, and `stopping` gates loop exit.
//!
//! With `use_caller`, the constructing thread is counted as a worker: its
//! main fiber is synthesized up front and a dedicated *scheduler fiber*
//! wraps the dispatch loop, resumed when `stop()` drains the queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use spindle_core::{FiberState, RtError, RtResult, kdebug, kerror};

use crate::fiber::{Fiber, yield_now};
use crate::thread::{self, Thread};

/// Affinity wildcard: the task may run on any worker.
pub const ANY_WORKER: i32 = -1;

/// How long the bare idle fiber naps between stop checks.
const IDLE_NAP: Duration = Duration::from_millis(10);

/// A unit of schedulable work: an existing fiber, or a callback that is
/// wrapped into a fresh fiber at dispatch time.
pub enum ScheduleTask {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

struct QueuedTask {
    task: ScheduleTask,
    /// Kernel tid the task is pinned to, or [`ANY_WORKER`].
    thread: i32,
}

/// Protocol the outer layer (the I/O manager) implements to override the
/// scheduler's virtual points.
pub trait SchedulerHooks: Send + Sync {
    /// Called by each worker before entering the dispatch loop.
    fn thread_begin(&self) {}

    /// Wake one idle worker. The bare scheduler has no wakeup channel.
    fn tickle(&self) {}

    /// Idle fiber body; must return once `stopping()` becomes true.
    fn idle(&self);

    /// Whether the dispatch loops may exit.
    fn stopping(&self) -> bool;
}

struct SchedulerShared {
    tasks: VecDeque<QueuedTask>,
    threads: Vec<Thread>,
    started: bool,
    stopping: bool,
}

pub struct Scheduler {
    name: String,
    shared: Mutex<SchedulerShared>,
    /// Worker threads to spawn in `start()` (excludes the caller).
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    use_caller: bool,
    caller_tid: libc::pid_t,
    /// The caller thread's scheduler fiber, resumed by `stop()`.
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Weak<Scheduler>> = const { RefCell::new(Weak::new()) };
}

impl Scheduler {
    /// Create a scheduler with `threads` workers. With `use_caller`, the
    /// calling thread is one of them and participates when `stop()` runs.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RtResult<Arc<Scheduler>> {
        assert!(threads > 0, "scheduler needs at least one thread");

        let thread_count = if use_caller { threads - 1 } else { threads };
        let sched = Arc::new(Scheduler {
            name: name.to_string(),
            shared: Mutex::new(SchedulerShared {
                tasks: VecDeque::new(),
                threads: Vec::new(),
                started: false,
                stopping: false,
            }),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            use_caller,
            caller_tid: if use_caller { thread::current_tid() } else { -1 },
            caller_fiber: Mutex::new(None),
            hooks: RwLock::new(None),
        });

        Scheduler::set_this(&sched);
        thread::set_current_name(name);

        if use_caller {
            // Bind the calling thread now: main fiber plus a dedicated
            // scheduler fiber wrapping the dispatch loop.
            Fiber::current();
            let weak = Arc::downgrade(&sched);
            let sched_fiber = Fiber::new(
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.run();
                    }
                },
                0,
                false,
            )?;
            Fiber::set_scheduler_fiber(sched_fiber.clone());
            *sched.caller_fiber.lock().unwrap() = Some(sched_fiber);
        }

        Ok(sched)
    }

    /// The scheduler owning the calling thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().upgrade())
    }

    fn set_this(sched: &Arc<Scheduler>) {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Arc::downgrade(sched));
    }

    /// Install the outer layer's hook protocol. Must happen before
    /// `start()`.
    pub fn set_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.hooks.write().unwrap() = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.read().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Push a task, waking a worker if the queue was empty.
    pub fn schedule(&self, task: ScheduleTask, thread: i32) {
        let need_tickle;
        {
            let mut sh = self.shared.lock().unwrap();
            need_tickle = sh.tasks.is_empty();
            sh.tasks.push_back(QueuedTask { task, thread });
        }
        if need_tickle {
            self.tickle();
        }
    }

    /// Schedule a fiber on any worker.
    #[inline]
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule(ScheduleTask::Fiber(fiber), ANY_WORKER);
    }

    /// Schedule a callback on any worker; it is wrapped into a fresh fiber
    /// at dispatch time.
    #[inline]
    pub fn schedule_callback<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(ScheduleTask::Callback(Box::new(f)), ANY_WORKER);
    }

    fn tickle(&self) {
        if let Some(h) = self.hooks() {
            h.tickle();
        }
    }

    /// Stop predicate, dispatched through the hook protocol.
    pub fn stopping(&self) -> bool {
        match self.hooks() {
            Some(h) => h.stopping(),
            None => self.base_stopping(),
        }
    }

    /// The scheduler's own part of the stop predicate: stop requested,
    /// queue drained, nobody mid-task.
    pub fn base_stopping(&self) -> bool {
        let sh = self.shared.lock().unwrap();
        sh.stopping && sh.tasks.is_empty() && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Spawn the worker threads. Idempotent; forbidden after `stop()`.
    pub fn start(self: &Arc<Self>) -> RtResult<()> {
        let mut sh = self.shared.lock().unwrap();
        if sh.stopping {
            return Err(RtError::Stopped);
        }
        if sh.started {
            return Ok(());
        }
        sh.started = true;

        for i in 0..self.thread_count {
            let me = Arc::clone(self);
            let t = Thread::spawn(format!("{}_{}", self.name, i), move || me.run())?;
            sh.threads.push(t);
        }
        kdebug!("scheduler {} started with {} worker threads", self.name, self.thread_count);
        Ok(())
    }

    /// Request shutdown, drain the queue, and join all workers.
    ///
    /// With `use_caller`, must be called on the constructing thread, which
    /// participates in the drain. Never call from a worker.
    pub fn stop(self: &Arc<Self>) {
        if self.stopping() {
            return;
        }
        {
            let mut sh = self.shared.lock().unwrap();
            sh.stopping = true;
        }

        for _ in 0..self.thread_count {
            self.tickle();
        }

        let caller_fiber = self.caller_fiber.lock().unwrap().take();
        if caller_fiber.is_some() {
            self.tickle();
        }
        if let Some(cf) = caller_fiber {
            assert_eq!(
                thread::current_tid(),
                self.caller_tid,
                "stop() must run on the thread that created this scheduler"
            );
            cf.resume();
            kdebug!("scheduler {} caller-thread drain finished", self.name);
        }

        let threads = {
            let mut sh = self.shared.lock().unwrap();
            std::mem::take(&mut sh.threads)
        };
        for t in threads {
            t.join();
        }
        kdebug!("scheduler {} stopped", self.name);
    }

    /// The dispatch loop. Runs as each worker's thread body, and inside
    /// the caller's scheduler fiber when `use_caller` is set.
    pub fn run(self: &Arc<Self>) {
        let tid = thread::current_tid();
        kdebug!("scheduler {} dispatch loop starting on tid {}", self.name, tid);

        Scheduler::set_this(self);
        if let Some(h) = self.hooks() {
            h.thread_begin();
        }
        Fiber::current();

        let idle_fiber = self.make_idle_fiber().expect("idle fiber allocation failed");

        loop {
            let mut picked: Option<ScheduleTask> = None;
            let mut tickle_me = false;
            {
                let mut sh = self.shared.lock().unwrap();
                let mut i = 0;
                while i < sh.tasks.len() {
                    // Skip tasks pinned to some other worker; remember to
                    // wake it.
                    let pin = sh.tasks[i].thread;
                    if pin != ANY_WORKER && pin != tid {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    picked = sh.tasks.remove(i).map(|q| q.task);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || !sh.tasks.is_empty();
            }

            if tickle_me {
                self.tickle();
            }

            match picked {
                Some(ScheduleTask::Fiber(fiber)) => {
                    {
                        // Serialize against a concurrent resume of the
                        // same fiber from another dispatcher.
                        let _guard = fiber.resume_lock().lock().unwrap();
                        if fiber.state() != FiberState::Term {
                            fiber.resume();
                        }
                    }
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                }
                Some(ScheduleTask::Callback(cb)) => {
                    match Fiber::new(cb, 0, true) {
                        Ok(fiber) => {
                            let _guard = fiber.resume_lock().lock().unwrap();
                            fiber.resume();
                        }
                        Err(e) => kerror!("scheduler {}: callback fiber failed: {}", self.name, e),
                    }
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        kdebug!("scheduler {} dispatch loop exiting on tid {}", self.name, tid);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn make_idle_fiber(self: &Arc<Self>) -> RtResult<Arc<Fiber>> {
        let hooks = self.hooks.read().unwrap().clone();
        let weak = Arc::downgrade(self);
        Fiber::new(
            move || match hooks.as_ref().and_then(|w| w.upgrade()) {
                Some(h) => h.idle(),
                None => default_idle(weak),
            },
            0,
            true,
        )
    }
}

/// Idle body of the bare scheduler: nap and yield until stop is requested.
fn default_idle(sched: Weak<Scheduler>) {
    loop {
        match sched.upgrade() {
            Some(s) if !s.stopping() => {}
            _ => break,
        }
        std::thread::sleep(IDLE_NAP);
        yield_now();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("use_caller", &self.use_caller)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callbacks_all_run() {
        let sched = Scheduler::new(3, false, "test-cbs").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let h = hits.clone();
            sched.schedule_callback(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.start().unwrap();
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 50);
        assert!(sched.stopping());
    }

    #[test]
    fn test_fiber_tasks_roundtrip_yield() {
        let sched = Scheduler::new(2, false, "test-fibers").unwrap();
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let h = hits.clone();
            let s = sched.clone();
            sched.schedule_callback(move || {
                h.fetch_add(1, Ordering::SeqCst);
                // Reschedule ourselves once mid-flight
                let cur = Fiber::current();
                s.schedule_fiber(cur.clone());
                cur.yield_fiber();
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "test-caller").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let h = hits.clone();
            sched.schedule_callback(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.start().unwrap();
        // With one thread and use_caller, nothing runs until stop()
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_affinity_pins_to_worker() {
        let sched = Scheduler::new(2, false, "test-affinity").unwrap();
        sched.start().unwrap();

        // Learn a worker tid
        let (tx, rx) = std::sync::mpsc::channel();
        sched.schedule_callback(move || {
            tx.send(thread::current_tid()).unwrap();
        });
        let worker_tid = rx.recv().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..5 {
            let tx = tx.clone();
            sched.schedule(
                ScheduleTask::Callback(Box::new(move || {
                    tx.send(thread::current_tid()).unwrap();
                })),
                worker_tid,
            );
        }
        for _ in 0..5 {
            assert_eq!(rx.recv().unwrap(), worker_tid);
        }
        sched.stop();
    }

    #[test]
    fn test_start_after_stop_fails() {
        let sched = Scheduler::new(1, false, "test-restart").unwrap();
        sched.start().unwrap();
        sched.stop();
        assert!(matches!(sched.start(), Err(RtError::Stopped)));
    }
}
