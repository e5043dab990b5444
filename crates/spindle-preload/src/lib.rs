//! # spindle-preload
//!
//! C symbol overrides for LD_PRELOAD interception. Built as a `cdylib`,
//! this library shadows the blocking libc entry points with the
//! cooperative versions from `spindle_io::hook`; the hook layer resolves
//! the shadowed originals through `dlsym(RTLD_NEXT)` at load time, so the
//! pass-through path (hooking disabled, non-socket fds, user-requested
//! non-blocking) behaves bit-for-bit like libc.
//!
//! ```sh
//! LD_PRELOAD=target/release/libspindle_preload.so ./your-program
//! ```
//!
//! Applications that cannot use the preload trick call `spindle_io::hook`
//! directly; the contract is identical.

use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use spindle_io::hook;

// ── sleep family ──

#[unsafe(no_mangle)]
pub extern "C" fn sleep(seconds: c_uint) -> c_uint {
    hook::sleep(seconds)
}

#[unsafe(no_mangle)]
pub extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    hook::usleep(usec)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    hook::nanosleep(req, rem)
}

// ── sockets ──

#[unsafe(no_mangle)]
pub extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    hook::socket(domain, ty, protocol)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    hook::connect(sockfd, addr, addrlen)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    hook::accept(sockfd, addr, addrlen)
}

// ── read family ──

#[unsafe(no_mangle)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    hook::read(fd, buf, count)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    hook::readv(fd, iov, iovcnt)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    hook::recv(sockfd, buf, len, flags)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    hook::recvfrom(sockfd, buf, len, flags, src_addr, addrlen)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    hook::recvmsg(sockfd, msg, flags)
}

// ── write family ──

#[unsafe(no_mangle)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    hook::write(fd, buf, count)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    hook::writev(fd, iov, iovcnt)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn send(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
) -> ssize_t {
    hook::send(sockfd, buf, len, flags)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    hook::sendto(sockfd, buf, len, flags, dest_addr, addrlen)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    hook::sendmsg(sockfd, msg, flags)
}

// ── lifecycle and control ──

#[unsafe(no_mangle)]
pub extern "C" fn close(fd: c_int) -> c_int {
    hook::close(fd)
}

// C-variadic in the real ABI; a fixed word-sized third argument matches
// the register layout for every int- and pointer-argument command.
#[unsafe(no_mangle)]
pub extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    hook::fcntl(fd, cmd, arg)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    hook::ioctl(fd, request, arg)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    hook::getsockopt(sockfd, level, optname, optval, optlen)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    hook::setsockopt(sockfd, level, optname, optval, optlen)
}
