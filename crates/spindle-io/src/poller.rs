//! Readiness poller
//!
//! Thin wrapper over epoll keeping the unsafe surface in one place. The
//! manager registers fds edge-triggered with a user-data word pointing
//! back at the fd's context record.

use spindle_core::{RtError, RtResult};

use crate::errno::errno;

/// Interest in readability. Same bit as `EPOLLIN`.
pub const EVENT_READ: u32 = libc::EPOLLIN as u32;

/// Interest in writability. Same bit as `EPOLLOUT`.
pub const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;

/// Edge-trigger flag for registrations.
pub(crate) const EDGE_TRIGGERED: u32 = libc::EPOLLET as u32;

pub(crate) struct Poller {
    epfd: libc::c_int,
}

impl Poller {
    pub fn new() -> RtResult<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RtError::Poller(errno()));
        }
        Ok(Poller { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: libc::c_int, events: u32, data: u64) -> RtResult<()> {
        let mut ev = libc::epoll_event { events, u64: data };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(RtError::Poller(errno()));
        }
        Ok(())
    }

    pub fn add(&self, fd: libc::c_int, events: u32, data: u64) -> RtResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, data)
    }

    pub fn modify(&self, fd: libc::c_int, events: u32, data: u64) -> RtResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, data)
    }

    pub fn delete(&self, fd: libc::c_int) -> RtResult<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Block for up to `timeout_ms` (-1 = forever). Returns the number of
    /// events filled into `events`, or the raw errno.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: libc::c_int) -> Result<usize, i32> {
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as libc::c_int, timeout_ms)
        };
        if n < 0 {
            return Err(errno());
        }
        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe2() -> (libc::c_int, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_add_wait_delete() {
        let poller = Poller::new().unwrap();
        let (rd, wr) = pipe2();

        poller.add(rd, EVENT_READ | EDGE_TRIGGERED, 99).unwrap();

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 8];
        // Nothing readable yet
        assert_eq!(poller.wait(&mut events, 0).unwrap(), 0);

        unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) };
        let n = poller.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        let data = events[0].u64;
        assert_eq!(data, 99);

        poller.delete(rd).unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_double_add_is_error() {
        let poller = Poller::new().unwrap();
        let (rd, wr) = pipe2();
        poller.add(rd, EVENT_READ, 1).unwrap();
        assert!(matches!(poller.add(rd, EVENT_READ, 1), Err(RtError::Poller(libc::EEXIST))));
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
