//! Connect-timeout scenario: a hooked `connect` against a peer that never
//! completes the handshake must fail with `ETIMEDOUT` after the fd's
//! configured send timeout.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use libc::c_void;
use spindle::{IoManager, hook};

fn loopback_addr(port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
    addr.sin_port = port.to_be();
    addr
}

/// Stand up a listener whose accept queue is full, so further SYNs are
/// dropped and a connect hangs. Returns (listener, filler fds, port).
fn saturated_listener() -> (libc::c_int, Vec<libc::c_int>, u16) {
    let l = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(l >= 0);
    let mut addr = loopback_addr(0);
    let len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    assert_eq!(
        unsafe { libc::bind(l, &addr as *const _ as *const libc::sockaddr, len) },
        0
    );
    assert_eq!(unsafe { libc::listen(l, 0) }, 0);
    let mut blen = len;
    unsafe { libc::getsockname(l, &mut addr as *mut _ as *mut libc::sockaddr, &mut blen) };
    let port = u16::from_be(addr.sin_port);

    // Fill the queue with raw non-blocking connects until one stops
    // completing; never accept anything.
    let dest = loopback_addr(port);
    let mut fillers = Vec::new();
    let mut saturated = false;
    for _ in 0..32 {
        let s = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(s >= 0);
        let fl = unsafe { libc::fcntl(s, libc::F_GETFL) };
        unsafe { libc::fcntl(s, libc::F_SETFL, fl | libc::O_NONBLOCK) };

        let rc = unsafe { libc::connect(s, &dest as *const _ as *const libc::sockaddr, len) };
        fillers.push(s);
        if rc == 0 {
            continue;
        }
        let mut pfd = libc::pollfd {
            fd: s,
            events: libc::POLLOUT,
            revents: 0,
        };
        let pr = unsafe { libc::poll(&mut pfd, 1, 300) };
        if pr == 0 {
            // Handshake is stuck: the queue is full.
            saturated = true;
            break;
        }
    }
    assert!(saturated, "could not saturate the accept queue");
    (l, fillers, port)
}

#[test]
fn connect_times_out_with_etimedout() {
    let (listener, fillers, port) = saturated_listener();

    let iom = IoManager::new(2, false, "e2e-connect").unwrap();
    let (tx, rx) = mpsc::channel();

    iom.scheduler().schedule_callback(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 100_000,
        };
        let rc = hook::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDTIMEO,
            &tv as *const libc::timeval as *const c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
        assert_eq!(rc, 0);

        let dest = loopback_addr(port);
        let t0 = Instant::now();
        let rc = hook::connect(
            fd,
            &dest as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        let elapsed = t0.elapsed();
        hook::close(fd);
        tx.send((rc, err, elapsed)).unwrap();
    });

    let (rc, err, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rc, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(90), "returned early: {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(600), "returned late: {:?}", elapsed);

    iom.stop();
    assert_eq!(iom.pending_event_count(), 0);
    for s in fillers {
        unsafe { libc::close(s) };
    }
    unsafe { libc::close(listener) };
}
