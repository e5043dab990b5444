//! TCP echo server on the spindle runtime
//!
//! One fiber accepts, one fiber per connection echoes until EOF. All
//! socket calls go through the cooperative hook layer, so thousands of
//! connections share a handful of worker threads.
//!
//! # Environment Variables
//!
//! - `SPINDLE_ECHO_PORT=<port>` - listen port (default: 8080)
//! - `SPINDLE_ECHO_THREADS=<n>` - worker threads (default: 4)
//! - `SPINDLE_LOG_LEVEL=<level>` - runtime log level

use anyhow::{Context, Result, bail};
use libc::c_void;
use spindle::{IoManager, env_get, hook, kinfo, kwarn};

fn main() -> Result<()> {
    let port: u16 = env_get("SPINDLE_ECHO_PORT", 8080);
    let threads: usize = env_get("SPINDLE_ECHO_THREADS", 4);

    let iom = IoManager::new(threads, false, "echod").context("starting io manager")?;
    kinfo!("echod listening on 127.0.0.1:{} with {} workers", port, threads);

    let (err_tx, err_rx) = std::sync::mpsc::channel::<anyhow::Error>();
    let sched = iom.scheduler().clone();
    iom.scheduler().schedule_callback(move || {
        if let Err(e) = accept_loop(port, &sched) {
            err_tx.send(e).ok();
        }
    });

    // The accept loop only returns on a setup failure.
    let err = err_rx.recv().context("accept loop vanished")?;
    iom.stop();
    Err(err)
}

fn accept_loop(port: u16, sched: &std::sync::Arc<spindle::Scheduler>) -> Result<()> {
    let listener = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    if listener < 0 {
        bail!("socket: {}", std::io::Error::last_os_error());
    }

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            listener,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
    addr.sin_port = port.to_be();
    let rc = unsafe {
        libc::bind(
            listener,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        bail!("bind 127.0.0.1:{}: {}", port, std::io::Error::last_os_error());
    }
    if unsafe { libc::listen(listener, 1024) } != 0 {
        bail!("listen: {}", std::io::Error::last_os_error());
    }

    loop {
        let fd = hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut());
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            kwarn!("accept: {}", err);
            bail!("accept failed: {}", err);
        }
        sched.schedule_callback(move || echo_connection(fd));
    }
}

fn echo_connection(fd: libc::c_int) {
    let mut buf = [0u8; 4096];
    loop {
        let n = hook::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if n <= 0 {
            break;
        }
        let mut sent = 0usize;
        while sent < n as usize {
            let w = hook::write(fd, buf[sent..].as_ptr() as *const c_void, n as usize - sent);
            if w <= 0 {
                hook::close(fd);
                return;
            }
            sent += w as usize;
        }
    }
    hook::close(fd);
}
