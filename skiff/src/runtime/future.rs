use super::status::ScriptStatus;
use crate::reactor::Waker as LoopWaker;

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type Listener = Box<dyn FnOnce(ScriptStatus) + Send>;

/// The eventual status of a running session.
///
/// Completion can be awaited by blocking ([`ScriptFuture::get`]), by
/// callback ([`ScriptFuture::set_listener`]) or as a [`Future`].
/// Cancellation is cooperative: the loop observes it once per iteration
/// and ends with [`ScriptStatus::Cancelled`].
#[derive(Clone)]
pub struct ScriptFuture {
    inner: Arc<FutureInner>,
}

struct FutureInner {
    state: Mutex<FutureState>,
    done: Condvar,
    cancelled: AtomicBool,
    /// Wakes the session's loop out of its poll.
    loop_waker: Mutex<Option<Arc<LoopWaker>>>,
}

#[derive(Default)]
struct FutureState {
    status: Option<ScriptStatus>,
    listener: Option<Listener>,
    wakers: Vec<Waker>,
}

impl ScriptFuture {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                state: Mutex::new(FutureState::default()),
                done: Condvar::new(),
                cancelled: AtomicBool::new(false),
                loop_waker: Mutex::new(None),
            }),
        }
    }

    /// Blocks until the session ends.
    pub fn get(&self) -> ScriptStatus {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(status) = &state.status {
                return status.clone();
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// Like [`ScriptFuture::get`], giving up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<ScriptStatus> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();

        while state.status.is_none() {
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        state.status.clone()
    }

    /// Asks the session to stop.
    ///
    /// Returns `false` if it had already ended.
    pub fn cancel(&self) -> bool {
        if self.is_done() {
            return false;
        }

        self.inner.cancelled.store(true, Ordering::Release);
        if let Some(waker) = self.inner.loop_waker.lock().as_ref() {
            waker.wake();
        }

        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().status.is_some()
    }

    /// Calls `listener` with the final status, on the thread completing
    /// the session, or right away if it already ended.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: FnOnce(ScriptStatus) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match &state.status {
            Some(status) => {
                let status = status.clone();
                drop(state);
                listener(status);
            }
            None => state.listener = Some(Box::new(listener)),
        }
    }

    pub(crate) fn attach(&self, waker: Arc<LoopWaker>) {
        *self.inner.loop_waker.lock() = Some(waker);
    }

    pub(crate) fn complete(&self, status: ScriptStatus) {
        let (listener, wakers) = {
            let mut state = self.inner.state.lock();
            if state.status.is_some() {
                return;
            }
            state.status = Some(status.clone());
            (state.listener.take(), std::mem::take(&mut state.wakers))
        };

        self.inner.done.notify_all();
        self.inner.loop_waker.lock().take();

        for waker in wakers {
            waker.wake();
        }
        if let Some(listener) = listener {
            listener(status);
        }
    }
}

impl Future for ScriptFuture {
    type Output = ScriptStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ScriptStatus> {
        let mut state = self.inner.state.lock();
        match &state.status {
            Some(status) => Poll::Ready(status.clone()),
            None => {
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for ScriptFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFuture")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
