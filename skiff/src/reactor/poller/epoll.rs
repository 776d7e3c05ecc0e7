//! The Linux poller: one `epoll` instance plus an `eventfd` for wake-ups.
//!
//! Sockets are registered level-triggered, so a source that leaves data
//! unread is reported again by the next poll. The `eventfd` is registered
//! once, under a token no source can ever receive.

use super::common::Interest;
use crate::reactor::event::Event;
use crate::reactor::poller::Waker;

use libc::{EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// Token of the wake-up `eventfd`. The reactor's slab never hands it out.
const WAKE_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 256;

const READ_READY: u32 = (EPOLLIN | EPOLLERR | EPOLLHUP) as u32;
const WRITE_READY: u32 = (EPOLLOUT | EPOLLERR) as u32;

/// Turns a `-1` syscall return into the pending OS error.
fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Milliseconds for `epoll_wait`, rounded up so a sub-millisecond timer
/// deadline does not become a busy spin. `None` blocks.
fn wait_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(timeout) => timeout.as_nanos().div_ceil(1_000_000).min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    }
}

fn epoll_flags(interest: Interest) -> u32 {
    let mut flags = 0;

    if interest.read {
        flags |= EPOLLIN as u32;
    }
    if interest.write {
        flags |= EPOLLOUT as u32;
    }

    flags
}

pub(crate) struct EpollPoller {
    epoll: OwnedFd,
    buffer: Vec<libc::epoll_event>,
    waker: Arc<Waker>,
}

impl Waker {
    /// Makes a blocked or upcoming poll return. Callable from any thread.
    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        // A full counter already guarantees a wake-up; the result is moot.
        unsafe {
            libc::write(self.0, (&one as *const u64).cast(), 8);
        }
    }

    fn reset(&self) {
        let mut count: u64 = 0;
        unsafe {
            libc::read(self.0, (&mut count as *mut u64).cast(), 8);
        }
    }
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<Self> {
        // Both descriptors are owned from the moment they exist, so every
        // early return closes them.
        let epoll = unsafe { OwnedFd::from_raw_fd(check(libc::epoll_create1(EPOLL_CLOEXEC))?) };

        let eventfd = check(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        let waker = Arc::new(Waker(eventfd));

        let mut wake = libc::epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        check(unsafe { libc::epoll_ctl(epoll.as_raw_fd(), EPOLL_CTL_ADD, eventfd, &mut wake) })?;

        Ok(Self {
            epoll,
            buffer: Vec::with_capacity(MAX_EVENTS),
            waker,
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_MOD, fd, token, interest)
    }

    /// Removes `fd`. A descriptor that is already gone is ignored.
    pub(crate) fn deregister(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    fn control(&self, op: libc::c_int, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: epoll_flags(interest),
            u64: token as u64,
        };

        check(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) }).map(drop)
    }

    /// Waits up to `timeout` and replaces `events` with what became ready,
    /// one entry per token.
    ///
    /// A wake-up or an interrupted wait yields an empty, successful poll.
    pub(crate) fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let ready = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.buffer.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                wait_millis(timeout),
            )
        };

        let ready = match check(ready) {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };

        // `epoll_wait` initialized exactly `ready` entries.
        unsafe { self.buffer.set_len(ready) };

        for raw in self.buffer.drain(..) {
            if raw.u64 == WAKE_TOKEN {
                self.waker.reset();
                continue;
            }

            let event = Event {
                token: raw.u64 as usize,
                readable: raw.events & READ_READY != 0,
                writable: raw.events & WRITE_READY != 0,
            };

            match events.iter_mut().find(|seen| seen.token == event.token) {
                Some(seen) => {
                    seen.readable |= event.readable;
                    seen.writable |= event.writable;
                }
                None => events.push(event),
            }
        }

        Ok(())
    }
}
