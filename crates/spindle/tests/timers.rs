//! Timer scenarios against a live I/O manager: bulk cancellation and
//! recurring timers driven by the idle loop's deadline-bounded poll.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use spindle::IoManager;

#[test]
fn cancelled_timers_never_fire() {
    let iom = IoManager::new(2, false, "e2e-timer-cancel").unwrap();
    let fired = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..1000usize {
        let f = fired.clone();
        handles.push(iom.timers().add_timer(
            300,
            Arc::new(move || f.lock().unwrap().push(i)),
            false,
        ));
    }
    for (i, h) in handles.iter().enumerate() {
        if i % 2 == 0 {
            assert!(h.cancel());
        }
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.lock().unwrap().len() < 500 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    // Settle: nothing beyond the odd half may arrive.
    std::thread::sleep(Duration::from_millis(200));

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 500);
    assert!(fired.iter().all(|i| i % 2 == 1));
    iom.stop();
}

#[test]
fn recurring_timer_fires_until_cancelled() {
    let iom = IoManager::new(2, false, "e2e-timer-recur").unwrap();
    let (tx, rx) = mpsc::channel();
    let count = Arc::new(AtomicUsize::new(0));

    let c = count.clone();
    let t0 = Instant::now();
    let handle = iom.timers().add_timer(
        50,
        Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            tx.send(()).ok();
        }),
        true,
    );

    for _ in 0..10 {
        rx.recv_timeout(Duration::from_secs(3)).unwrap();
    }
    assert!(t0.elapsed() >= Duration::from_millis(450));
    assert!(handle.cancel());

    // Absorb anything scheduled before the cancel landed, then require
    // silence.
    std::thread::sleep(Duration::from_millis(100));
    while rx.try_recv().is_ok() {}
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    iom.stop();
}

#[test]
fn timer_refresh_delays_firing() {
    let iom = IoManager::new(1, false, "e2e-timer-refresh").unwrap();
    let (tx, rx) = mpsc::channel();

    let t0 = Instant::now();
    let handle = iom.timers().add_timer(
        200,
        Arc::new(move || {
            tx.send(()).ok();
        }),
        false,
    );

    std::thread::sleep(Duration::from_millis(100));
    assert!(handle.refresh());

    rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert!(t0.elapsed() >= Duration::from_millis(280), "fired at {:?}", t0.elapsed());
    iom.stop();
}
