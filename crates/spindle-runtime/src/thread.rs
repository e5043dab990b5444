//! Worker threads
//!
//! Thin wrapper over `std::thread` adding a synchronized start handshake
//! (the constructor does not return until the new thread has published its
//! kernel tid and installed its name) and tid/name thread-locals for log
//! lines and task affinity.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::JoinHandle;

use spindle_core::{RtError, RtResult};

thread_local! {
    static THREAD_TID: Cell<libc::pid_t> = const { Cell::new(-1) };
    static THREAD_NAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Kernel tid of the calling thread, cached in TLS after the first call.
pub fn current_tid() -> libc::pid_t {
    THREAD_TID.with(|c| {
        let mut tid = c.get();
        if tid == -1 {
            tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            c.set(tid);
        }
        tid
    })
}

/// Name of the calling thread, if one was installed.
pub fn current_name() -> Option<String> {
    THREAD_NAME.with(|c| c.borrow().clone())
}

/// Install a name for the calling thread (TLS only; spawned workers also
/// get their OS-level name through `std::thread::Builder`).
pub fn set_current_name(name: &str) {
    THREAD_NAME.with(|c| *c.borrow_mut() = Some(name.to_string()));
}

/// Counting semaphore used for the start handshake.
struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }
}

/// A named OS thread whose tid is known as soon as the constructor
/// returns.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawn `body` on a new named thread and wait for it to come up.
    pub fn spawn<F>(name: String, body: F) -> RtResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new());
        let tid_slot = Arc::new(AtomicI32::new(-1));

        let sem2 = sem.clone();
        let tid2 = tid_slot.clone();
        let tls_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_current_name(&tls_name);
                tid2.store(current_tid(), Ordering::Release);
                sem2.signal();
                body();
            })
            .map_err(|_| RtError::ThreadSpawn)?;

        sem.wait();
        Ok(Thread {
            handle: Some(handle),
            tid: tid_slot.load(Ordering::Acquire),
            name,
        })
    }

    #[inline]
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_known_after_spawn() {
        let t = Thread::spawn("spindle-test".into(), || {}).unwrap();
        assert!(t.tid() > 0);
        assert_ne!(t.tid(), current_tid());
        t.join();
    }

    #[test]
    fn test_name_visible_inside() {
        let (tx, rx) = std::sync::mpsc::channel();
        let t = Thread::spawn("named-worker".into(), move || {
            tx.send(current_name()).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("named-worker"));
        t.join();
    }

    #[test]
    fn test_current_tid_stable() {
        assert_eq!(current_tid(), current_tid());
    }
}
