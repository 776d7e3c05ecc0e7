//! The handle abstraction.
//!
//! A handle owns one OS resource and exposes a small capability set:
//! read (as a stream of [`ReadEvent`]s), ordered writes, half-close, and an
//! idempotent close. Every handle kind implements [`Handle`]; operations a
//! kind cannot perform fail with `EINVAL`.
//!
//! Handles register with their loop when created and unregister on close.
//! Anything still registered when the session ends is force-closed.

mod stream;

pub use stream::{READ_AHEAD, StreamHandle};

use crate::error::{Errno, OsError, ScriptResult};
use crate::scheduler::EventLoop;

use std::cell::{Cell, RefCell};

/// Loop-unique handle identifier.
pub type HandleId = u64;

/// What kind of resource a handle wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Tcp,
    Pipe,
    File,
    Console,
}

/// One delivery to a read callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// A chunk of bytes, exactly as read.
    Data(Vec<u8>),

    /// End of stream. Nothing is delivered afterwards.
    Eof,

    /// A read failure. Nothing is delivered afterwards.
    Error(OsError),
}

/// Completion of a write or half-close.
pub type WriteCallback = Box<dyn FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult>;

/// Receiver of read events.
pub type ReadCallback = Box<dyn FnMut(&mut EventLoop, ReadEvent) -> ScriptResult>;

/// Capability interface shared by every handle kind.
pub trait Handle {
    fn id(&self) -> HandleId;

    fn kind(&self) -> HandleKind;

    /// Queues `data`. `on_complete` fires exactly once, after every
    /// earlier write on this handle has completed.
    fn write(
        &self,
        _lp: &mut EventLoop,
        _data: Vec<u8>,
        _on_complete: WriteCallback,
    ) -> Result<(), OsError> {
        Err(not_capable("write"))
    }

    /// Queues a half-close behind any pending writes.
    fn shutdown(&self, _lp: &mut EventLoop, _on_complete: WriteCallback) -> Result<(), OsError> {
        Err(not_capable("shutdown"))
    }

    /// Starts delivering read events to `on_read`, replacing any previous
    /// callback.
    fn start_reading(&self, _lp: &mut EventLoop, _on_read: ReadCallback) -> Result<(), OsError> {
        Err(not_capable("read"))
    }

    fn stop_reading(&self, _lp: &mut EventLoop) {}

    /// Writes queued and not yet completed.
    fn writes_outstanding(&self) -> usize {
        0
    }

    fn is_closed(&self) -> bool;

    /// Releases the resource. Closing twice is a no-op.
    fn close(&self, lp: &mut EventLoop);
}

pub(crate) fn not_capable(syscall: &'static str) -> OsError {
    OsError::new(Errno::InvalidArgument, syscall)
}

/// Holds a handle's read callback across re-entrant dispatch.
///
/// The callback is taken out while it runs so it may freely call back into
/// its own handle. It is put back afterwards unless it was replaced or
/// cleared in the meantime.
#[derive(Default)]
pub(crate) struct ReadSlot {
    callback: RefCell<Option<ReadCallback>>,
    generation: Cell<u64>,
}

impl ReadSlot {
    pub(crate) fn set(&self, callback: ReadCallback) {
        self.generation.set(self.generation.get() + 1);
        *self.callback.borrow_mut() = Some(callback);
    }

    pub(crate) fn clear(&self) {
        self.generation.set(self.generation.get() + 1);
        self.callback.borrow_mut().take();
    }

    pub(crate) fn dispatch(&self, lp: &mut EventLoop, event: ReadEvent) -> ScriptResult {
        let generation = self.generation.get();
        let Some(mut callback) = self.callback.borrow_mut().take() else {
            return Ok(());
        };

        let outcome = callback(lp, event);

        if self.generation.get() == generation {
            *self.callback.borrow_mut() = Some(callback);
        }

        outcome
    }
}
