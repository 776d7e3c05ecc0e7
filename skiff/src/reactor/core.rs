use super::event::Event;
use super::poller::{Interest, Poller, Waker};
use crate::error::ScriptResult;
use crate::scheduler::EventLoop;
use crate::utils::Slab;

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Something the reactor can hand readiness to.
///
/// Implementors re-check readiness with non-blocking syscalls and run
/// their own callbacks with full access to the loop.
pub(crate) trait Selectable {
    fn selected(&self, lp: &mut EventLoop, event: Event) -> ScriptResult;
}

/// Readiness-based reactor owned by a single event loop.
///
/// The reactor maps poller tokens to the sources that registered them.
/// It never runs callbacks itself: [`Reactor::take_ready`] resolves the
/// last poll's events and the loop dispatches them.
pub(crate) struct Reactor {
    /// Platform poller.
    poller: Poller,

    /// Registered sources, indexed by token.
    sources: Slab<Rc<dyn Selectable>>,

    /// Events gathered by the last poll.
    events: Vec<Event>,
}

impl Reactor {
    pub(crate) fn new(poller: Poller) -> Self {
        Self {
            poller,
            sources: Slab::new(16),
            events: Vec::with_capacity(64),
        }
    }

    /// Waker that interrupts a blocked [`Reactor::poll`] from any thread.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.poller.waker()
    }

    /// Registers `fd` and returns the token it will be reported under.
    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        source: Rc<dyn Selectable>,
        interest: Interest,
    ) -> io::Result<usize> {
        let token = self.sources.insert(source);

        if let Err(e) = self.poller.register(fd, token, interest) {
            self.sources.remove(token);
            return Err(e);
        }

        Ok(token)
    }

    /// Changes the readiness `fd` is watched for.
    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.poller.reregister(fd, token, interest)
    }

    /// Stops watching `fd` and forgets its source.
    pub(crate) fn deregister(&mut self, fd: RawFd, token: usize) {
        self.poller.deregister(fd);
        self.sources.remove(token);
    }

    /// Blocks until readiness, a wake-up, or `timeout`.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.poller.poll(&mut self.events, timeout)
    }

    /// Resolves the last poll's events to their sources.
    ///
    /// Events whose token no longer maps to a source are dropped.
    pub(crate) fn take_ready(&mut self) -> Vec<(Rc<dyn Selectable>, Event)> {
        self.events
            .drain(..)
            .filter_map(|event| {
                self.sources
                    .get(event.token)
                    .map(|source| (source.clone(), event))
            })
            .collect()
    }
}
