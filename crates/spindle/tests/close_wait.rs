//! Close-under-wait scenario: closing an fd out from under a fiber parked
//! in a hooked read resumes the fiber promptly.

use std::sync::mpsc;
use std::time::Duration;

use libc::c_void;
use spindle::{IoManager, fd_manager, hook};

#[test]
fn close_unblocks_parked_reader() {
    let iom = IoManager::new(2, false, "e2e-close").unwrap();

    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let (reader, peer) = (fds[0], fds[1]);

    // Register hook state for the reader side as the socket hook would.
    fd_manager().get(reader, true).unwrap();

    let (tx, rx) = mpsc::channel();
    iom.scheduler().schedule_callback(move || {
        let mut buf = [0u8; 16];
        let n = hook::read(reader, buf.as_mut_ptr() as *mut c_void, buf.len());
        let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        tx.send((n, err)).unwrap();
    });

    // Let the reader park on READ readiness.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while iom.pending_event_count() != 1 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(iom.pending_event_count(), 1);

    let (done_tx, done_rx) = mpsc::channel();
    iom.scheduler().schedule_callback(move || {
        hook::close(reader);
        done_tx.send(()).unwrap();
    });
    done_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let (n, err) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(
        n == 0 || (n == -1 && err == libc::EBADF),
        "unexpected read result n={} err={}",
        n,
        err
    );
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    unsafe { libc::close(peer) };
}
