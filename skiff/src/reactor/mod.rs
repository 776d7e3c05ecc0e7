//! Readiness-based I/O.
//!
//! The reactor owns the platform poller and maps its tokens back to the
//! sources that registered them. Each event loop owns exactly one reactor
//! and polls it once per turn, bounded by the computed poll timeout.
//!
//! Sockets are the only sources driven by readiness. Everything that
//! cannot be made non-blocking (files, pipes, the console) goes through
//! worker threads instead; see [`crate::handle::StreamHandle`].

mod core;
mod event;
mod poller;
mod socket;

pub(crate) use core::{Reactor, Selectable};
pub(crate) use poller::platform;
pub(crate) use poller::{Poller, Waker};

pub use socket::{SocketAddress, SocketHandle};
