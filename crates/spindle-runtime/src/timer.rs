//! Deadline-ordered timers
//!
//! A reader/writer-locked ordered set keyed by (absolute deadline, stable
//! timer id); ties on the deadline cannot collide. The owner (the I/O
//! manager) polls `get_next_delay` to bound its poller wait and calls
//! `harvest_expired` afterwards; a timer inserted in front of everything
//! else fires the front-insert hook at most once per quiescent period
//! (the `tickled` edge flag, cleared by `get_next_delay`).
//!
//! The clock is CLOCK_REALTIME in milliseconds. Because the wall clock can
//! be stepped, a harvest that observes time moving backwards by more than
//! an hour treats every pending timer as expired rather than stalling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

/// Callback type for timers. `Arc` so recurring timers can fire the same
/// callback repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Returned by `get_next_delay` when no timer is pending.
pub const NO_TIMER: u64 = u64::MAX;

/// A backwards step larger than this forces all pending timers to expire.
const CLOCK_ROLLBACK_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

/// Milliseconds on the wall clock.
pub(crate) fn now_ms() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

type TimerKey = (u64, u64); // (deadline ms, timer id)

struct TimerNodeInner {
    interval_ms: u64,
    deadline_ms: u64,
    recurring: bool,
    cb: Option<TimerCallback>,
}

/// One pending (or fired/cancelled) timer. Handles are `Arc<Timer>`;
/// cancel/refresh/reset go through the owning manager's lock.
pub struct Timer {
    id: u64,
    inner: Mutex<TimerNodeInner>,
    owner: Weak<TimerShared>,
}

struct TimerSet {
    set: BTreeMap<TimerKey, Arc<Timer>>,
    prev_now: u64,
}

struct TimerShared {
    timers: RwLock<TimerSet>,
    tickled: AtomicBool,
    front_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

/// Concurrent ordered set of pending deadlines.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            shared: Arc::new(TimerShared {
                timers: RwLock::new(TimerSet {
                    set: BTreeMap::new(),
                    prev_now: now_ms(),
                }),
                tickled: AtomicBool::new(false),
                front_hook: OnceLock::new(),
            }),
        }
    }

    /// Install the hook invoked when a timer lands at the front of the
    /// set (the owner uses it to shorten its poller wait). Set once.
    pub fn set_front_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let _ = self.shared.front_hook.set(Box::new(hook));
    }

    /// Register a timer firing `interval_ms` from now.
    pub fn add_timer(&self, interval_ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        self.add_timer_at(now_ms(), interval_ms, cb, recurring)
    }

    fn add_timer_at(
        &self,
        now: u64,
        interval_ms: u64,
        cb: TimerCallback,
        recurring: bool,
    ) -> Arc<Timer> {
        let deadline = now + interval_ms;
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(TimerNodeInner {
                interval_ms,
                deadline_ms: deadline,
                recurring,
                cb: Some(cb),
            }),
            owner: Arc::downgrade(&self.shared),
        });

        let at_front = {
            let mut g = self.shared.timers.write().unwrap();
            let key = (deadline, timer.id);
            g.set.insert(key, timer.clone());
            self.shared.note_front_insert(&g, key)
        };
        if at_front {
            self.shared.fire_front_hook();
        }
        timer
    }

    /// Register a timer whose callback only runs if `cond` can still be
    /// upgraded at fire time. This is the race-free cancellation idiom the
    /// hook layer uses: dropping the condition neutralizes an in-flight
    /// firing.
    pub fn add_condition_timer<T>(
        &self,
        interval_ms: u64,
        cb: TimerCallback,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: Send + Sync + 'static,
    {
        let gated: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(interval_ms, gated, recurring)
    }

    /// Milliseconds until the nearest deadline: 0 when one is already due,
    /// [`NO_TIMER`] when the set is empty. Re-arms the front-insert edge.
    pub fn get_next_delay(&self) -> u64 {
        self.next_delay_at(now_ms())
    }

    fn next_delay_at(&self, now: u64) -> u64 {
        let g = self.shared.timers.read().unwrap();
        self.shared.tickled.store(false, Ordering::SeqCst);

        match g.set.keys().next() {
            None => NO_TIMER,
            Some(&(deadline, _)) => deadline.saturating_sub(now),
        }
    }

    /// Whether any timer is pending.
    pub fn has_timers(&self) -> bool {
        !self.shared.timers.read().unwrap().set.is_empty()
    }

    /// Pop every expired timer's callback into `cbs`, reinserting
    /// recurring timers at `now + interval`. A clock rollback expires
    /// everything.
    pub fn harvest_expired(&self, cbs: &mut Vec<TimerCallback>) {
        self.harvest_expired_at(now_ms(), cbs);
    }

    fn harvest_expired_at(&self, now: u64, cbs: &mut Vec<TimerCallback>) {
        let mut g = self.shared.timers.write().unwrap();

        let rollback = now < g.prev_now.saturating_sub(CLOCK_ROLLBACK_MS);
        g.prev_now = now;

        loop {
            let Some((&key, _)) = g.set.first_key_value() else {
                break;
            };
            if !rollback && key.0 > now {
                break;
            }
            let timer = g.set.remove(&key).unwrap();
            let mut ti = timer.inner.lock().unwrap();
            let Some(cb) = ti.cb.clone() else {
                continue;
            };
            cbs.push(cb);

            if ti.recurring {
                ti.deadline_ms = now + ti.interval_ms;
                let key = (ti.deadline_ms, timer.id);
                drop(ti);
                g.set.insert(key, timer);
            } else {
                ti.cb = None;
            }
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

impl TimerShared {
    /// Must be called with the write lock held, right after an insert.
    fn note_front_insert(&self, g: &TimerSet, key: TimerKey) -> bool {
        let at_front =
            g.set.keys().next() == Some(&key) && !self.tickled.load(Ordering::SeqCst);
        if at_front {
            self.tickled.store(true, Ordering::SeqCst);
        }
        at_front
    }

    fn fire_front_hook(&self) {
        if let Some(hook) = self.front_hook.get() {
            hook();
        }
    }
}

impl Timer {
    /// Cancel this timer: clears the callback and removes it from the
    /// set. Returns false when it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.owner.upgrade() else {
            return false;
        };
        let mut g = shared.timers.write().unwrap();
        let mut ti = self.inner.lock().unwrap();
        if ti.cb.is_none() {
            return false;
        }
        ti.cb = None;
        g.set.remove(&(ti.deadline_ms, self.id));
        true
    }

    /// Push the deadline back to now + interval. No-op on a cancelled or
    /// already-fired timer.
    pub fn refresh(&self) -> bool {
        self.refresh_at(now_ms())
    }

    fn refresh_at(&self, now: u64) -> bool {
        let Some(shared) = self.owner.upgrade() else {
            return false;
        };
        let mut g = shared.timers.write().unwrap();
        let mut ti = self.inner.lock().unwrap();
        if ti.cb.is_none() {
            return false;
        }
        let Some(node) = g.set.remove(&(ti.deadline_ms, self.id)) else {
            return false;
        };
        ti.deadline_ms = now + ti.interval_ms;
        let key = (ti.deadline_ms, self.id);
        drop(ti);
        g.set.insert(key, node);
        true
    }

    /// Change the interval. With `from_now` the new deadline is measured
    /// from the current instant, otherwise from the old start point.
    /// Re-runs the front-insert edge like a fresh registration.
    pub fn reset(&self, interval_ms: u64, from_now: bool) -> bool {
        self.reset_at(now_ms(), interval_ms, from_now)
    }

    fn reset_at(&self, now: u64, interval_ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.owner.upgrade() else {
            return false;
        };

        let at_front;
        {
            let mut g = shared.timers.write().unwrap();
            let mut ti = self.inner.lock().unwrap();

            if interval_ms == ti.interval_ms && !from_now {
                return true;
            }
            if ti.cb.is_none() {
                return false;
            }
            let Some(node) = g.set.remove(&(ti.deadline_ms, self.id)) else {
                return false;
            };

            let start = if from_now {
                now
            } else {
                ti.deadline_ms - ti.interval_ms
            };
            ti.interval_ms = interval_ms;
            ti.deadline_ms = start + interval_ms;
            let key = (ti.deadline_ms, self.id);
            drop(ti);
            g.set.insert(key, node);
            at_front = shared.note_front_insert(&g, key);
        }
        if at_front {
            shared.fire_front_hook();
        }
        true
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ti = self.inner.lock().unwrap();
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("interval_ms", &ti.interval_ms)
            .field("deadline_ms", &ti.deadline_ms)
            .field("recurring", &ti.recurring)
            .field("cancelled", &ti.cb.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_cb(hits: &Arc<AtomicUsize>) -> TimerCallback {
        let h = hits.clone();
        Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_empty_delay_is_sentinel() {
        let tm = TimerManager::new();
        assert_eq!(tm.get_next_delay(), NO_TIMER);
        assert!(!tm.has_timers());
    }

    #[test]
    fn test_delay_and_harvest_order() {
        let tm = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = 1_000_000;

        for (tag, interval) in [(3u32, 300u64), (1, 100), (2, 200)] {
            let o = order.clone();
            tm.add_timer_at(now, interval, Arc::new(move || o.lock().unwrap().push(tag)), false);
        }

        assert_eq!(tm.next_delay_at(now), 100);
        assert_eq!(tm.next_delay_at(now + 150), 0);

        let mut cbs = Vec::new();
        tm.harvest_expired_at(now + 1000, &mut cbs);
        assert_eq!(cbs.len(), 3);
        for cb in &cbs {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(tm.next_delay_at(now + 1000), NO_TIMER);
    }

    #[test]
    fn test_cancel_removes_and_reports() {
        let tm = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let now = 1_000_000;

        let t = tm.add_timer_at(now, 50, counter_cb(&hits), false);
        assert!(t.cancel());
        assert!(!t.cancel());

        let mut cbs = Vec::new();
        tm.harvest_expired_at(now + 100, &mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_race_pattern() {
        // 1000 timers at 10ms, every even one cancelled: exactly the odd
        // half fires.
        let tm = TimerManager::new();
        let now = 2_000_000;
        let fired = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..1000u32 {
            let f = fired.clone();
            handles.push(tm.add_timer_at(now, 10, Arc::new(move || f.lock().unwrap().push(i)), false));
        }
        for (i, h) in handles.iter().enumerate() {
            if i % 2 == 0 {
                assert!(h.cancel());
            }
        }

        let mut cbs = Vec::new();
        tm.harvest_expired_at(now + 50, &mut cbs);
        assert_eq!(cbs.len(), 500);
        for cb in cbs {
            cb();
        }
        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 500);
        assert!(fired.iter().all(|i| i % 2 == 1));
    }

    #[test]
    fn test_recurring_reinserts() {
        let tm = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let now = 3_000_000;

        let t = tm.add_timer_at(now, 50, counter_cb(&hits), true);
        for round in 1..=10u64 {
            let mut cbs = Vec::new();
            tm.harvest_expired_at(now + round * 50, &mut cbs);
            assert_eq!(cbs.len(), 1);
            for cb in cbs {
                cb();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        assert!(t.cancel());
        let mut cbs = Vec::new();
        tm.harvest_expired_at(now + 10_000, &mut cbs);
        assert!(cbs.is_empty());
    }

    #[test]
    fn test_clock_rollback_expires_everything() {
        let tm = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let now = 10_000_000;

        // Establish prev_now
        tm.harvest_expired_at(now, &mut Vec::new());
        tm.add_timer_at(now, 60_000, counter_cb(&hits), false);
        tm.add_timer_at(now, 120_000, counter_cb(&hits), false);

        // Within an hour backwards: nothing fires
        let mut cbs = Vec::new();
        tm.harvest_expired_at(now - 30 * 60 * 1000, &mut cbs);
        assert!(cbs.is_empty());

        // More than an hour backwards: everything fires
        let mut cbs = Vec::new();
        tm.harvest_expired_at(now - 2 * 60 * 60 * 1000, &mut cbs);
        assert_eq!(cbs.len(), 2);
    }

    #[test]
    fn test_reset_same_interval_is_noop() {
        let tm = TimerManager::new();
        let now = 4_000_000;
        let t = tm.add_timer_at(now, 500, Arc::new(|| {}), false);
        assert!(t.reset(500, false));
        assert_eq!(tm.next_delay_at(now), 500);
    }

    #[test]
    fn test_reset_from_now_moves_deadline() {
        let tm = TimerManager::new();
        let now = 5_000_000;
        let t = tm.add_timer_at(now, 500, Arc::new(|| {}), false);
        assert!(t.reset_at(now + 100, 1000, true));
        assert_eq!(tm.next_delay_at(now + 100), 1000);
    }

    #[test]
    fn test_refresh_pushes_back() {
        let tm = TimerManager::new();
        let now = 6_000_000;
        let t = tm.add_timer_at(now, 500, Arc::new(|| {}), false);
        assert!(t.refresh_at(now + 400));
        assert_eq!(tm.next_delay_at(now + 400), 500);
        assert!(t.cancel());
        assert!(!t.refresh());
    }

    #[test]
    fn test_condition_timer_dropped_cond_is_silent() {
        let tm = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let now = 7_000_000;

        let live = Arc::new(());
        tm.add_condition_timer(10, counter_cb(&hits), Arc::downgrade(&live), false);

        let dead = Arc::new(());
        let dead_weak = Arc::downgrade(&dead);
        drop(dead);
        tm.add_condition_timer(10, counter_cb(&hits), dead_weak, false);

        let mut cbs = Vec::new();
        tm.harvest_expired_at(now + 100_000_000, &mut cbs);
        for cb in cbs {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_front_insert_hook_edges() {
        let tm = TimerManager::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        tm.set_front_hook(move || {
            t.fetch_add(1, Ordering::SeqCst);
        });

        let now = 8_000_000;
        tm.add_timer_at(now, 1000, Arc::new(|| {}), false);
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // Not at front: no hook
        tm.add_timer_at(now, 2000, Arc::new(|| {}), false);
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // At front but edge not re-armed yet: no hook
        tm.add_timer_at(now, 500, Arc::new(|| {}), false);
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // get_next_delay re-arms the edge
        tm.next_delay_at(now);
        tm.add_timer_at(now, 100, Arc::new(|| {}), false);
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
