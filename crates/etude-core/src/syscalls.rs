// src/syscalls.rs
//! Thin libc wrappers: epoll, non-blocking read/writev and the wake-up pipe.
//!
//! Would-block is never an error here. Calls that can block report it as
//! `Ok(None)`.

use crate::error::{EtudeError, EtudeResult};
use libc::{c_int, c_void};
use std::io;
use std::ptr;

pub use libc::epoll_event;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;

/// Owned epoll instance.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(EtudeError::last_os("epoll_create1"));
        }
        Ok(Self { fd })
    }

    /// Register `fd`. `events` is the full interest set, trigger and
    /// one-shot flags included.
    pub fn add(&self, fd: c_int, token: u64, events: u32) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    /// Re-arm `fd`; needed after every one-shot event.
    pub fn modify(&self, fd: c_int, token: u64, events: u32) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    pub fn delete(&self, fd: c_int) -> EtudeResult<()> {
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(EtudeError::Syscall {
                    call: "epoll_ctl(DEL)",
                    source: err,
                });
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, events: u32) -> EtudeResult<()> {
        let mut event = epoll_event { events, u64: token };
        if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
            return Err(EtudeError::last_os("epoll_ctl"));
        }
        Ok(())
    }

    /// Wait for events. An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(EtudeError::Syscall {
                call: "epoll_wait",
                source: err,
            });
        }
        Ok(res as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// `Ok(Some(0))` is end of stream, `Ok(None)` would block.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> EtudeResult<Option<usize>> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => {
                return Err(EtudeError::Syscall {
                    call: "read",
                    source: err,
                });
            }
        }
    }
}

pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> EtudeResult<Option<usize>> {
    writev_nonblocking(fd, &[buf])
}

/// Vectored write of up to eight segments; empty segments are skipped.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> EtudeResult<Option<usize>> {
    let mut iovecs: [libc::iovec; 8] = unsafe { std::mem::zeroed() };
    let mut count = 0;
    for buf in bufs.iter().filter(|b| !b.is_empty()).take(iovecs.len()) {
        iovecs[count] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        count += 1;
    }
    if count == 0 {
        return Ok(Some(0));
    }

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), count as c_int) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => {
                return Err(EtudeError::Syscall {
                    call: "writev",
                    source: err,
                });
            }
        }
    }
}

pub fn close_fd(fd: c_int) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Non-blocking, close-on-exec pipe. Returns (read_fd, write_fd).
pub fn create_pipe() -> EtudeResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
        return Err(EtudeError::last_os("pipe2"));
    }
    Ok((fds[0], fds[1]))
}

/// Poke the read end awake. A full pipe already has a wake-up pending.
pub fn notify_pipe(write_fd: c_int) -> EtudeResult<()> {
    write_nonblocking(write_fd, &[1u8]).map(|_| ())
}

/// Empty the pipe so a level-triggered registration stops firing.
pub fn drain_pipe(read_fd: c_int) -> EtudeResult<()> {
    let mut scratch = [0u8; 64];
    loop {
        match read_nonblocking(read_fd, &mut scratch)? {
            Some(0) | None => return Ok(()),
            Some(_) => continue,
        }
    }
}
