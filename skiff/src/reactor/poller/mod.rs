//! The OS readiness poller and raw socket calls.
//!
//! Skiff runs on Linux only: [`Poller`] is backed by `epoll`, and
//! [`platform`] holds the `libc` wrappers sockets and pipes are built from.

pub(crate) mod common;

pub(crate) use common::{Interest, Waker};

mod epoll;

pub(crate) type Poller = epoll::EpollPoller;

pub(crate) mod unix;

pub(crate) use unix as platform;
