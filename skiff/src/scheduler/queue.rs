use super::EventLoop;
use super::timer::{Timer, TimerState};
use crate::error::ScriptResult;
use crate::reactor::Waker;

use crossbeam_queue::SegQueue;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Opaque context attached to a task or timer.
///
/// Visible through [`EventLoop::domain`] while the activity runs.
pub type Domain = Arc<dyn Any + Send + Sync>;

/// Work submitted from any thread, run later on the loop thread.
pub type Task = Box<dyn FnOnce(&mut EventLoop) -> ScriptResult + Send>;

/// Value posted to a loop-side port.
pub(crate) type Payload = Box<dyn Any + Send>;

/// Identifier of a loop-side port; see [`EventLoop::open_port`].
pub(crate) type PortId = u64;

pub(crate) struct QueuedTask {
    pub(crate) domain: Option<Domain>,
    pub(crate) work: Task,
}

/// State shared between the loop thread and every [`LoopHandle`].
struct Shared {
    /// Multi-producer, single-consumer task queue.
    tasks: SegQueue<QueuedTask>,

    /// Liveness references. The loop may exit only at zero.
    pins: AtomicI64,

    /// Timer identifiers, unique per loop.
    next_timer: AtomicU64,

    /// Interrupts the loop's poll.
    waker: Arc<Waker>,
}

/// Thread-safe handle onto a running event loop.
///
/// This is the only way other threads may affect the loop: enqueue work,
/// pin and unpin it, or schedule timers. Every enqueue wakes the loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: SegQueue::new(),
                pins: AtomicI64::new(0),
                next_timer: AtomicU64::new(1),
                waker,
            }),
        }
    }

    /// Queues `task` to run on the loop thread.
    ///
    /// Tasks run in enqueue order.
    pub fn enqueue_task<F>(&self, task: F)
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult + Send + 'static,
    {
        self.push(QueuedTask {
            domain: None,
            work: Box::new(task),
        });
    }

    /// Like [`LoopHandle::enqueue_task`], running the task inside `domain`.
    pub fn enqueue_task_in<F>(&self, domain: Domain, task: F)
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult + Send + 'static,
    {
        self.push(QueuedTask {
            domain: Some(domain),
            work: Box::new(task),
        });
    }

    fn push(&self, task: QueuedTask) {
        self.shared.tasks.push(task);
        self.shared.waker.wake();
    }

    pub(crate) fn pop(&self) -> Option<QueuedTask> {
        self.shared.tasks.pop()
    }

    pub(crate) fn has_tasks(&self) -> bool {
        !self.shared.tasks.is_empty()
    }

    /// Delivers `payload` to a port opened on the loop thread.
    pub(crate) fn post(&self, port: PortId, payload: Payload) {
        self.enqueue_task(move |lp| lp.deliver(port, payload));
    }

    /// Schedules a timer from any thread.
    ///
    /// The timer is created on the loop thread when the registration task
    /// runs; the returned [`Timer`] can be cancelled before that happens.
    pub fn schedule_timer<F>(&self, delay: Duration, interval: Option<Duration>, callback: F) -> Timer
    where
        F: FnMut(&mut EventLoop) -> ScriptResult + Send + 'static,
    {
        let state = TimerState::new(self.next_timer_id());
        self.pin();

        let timer = Timer::new(state.clone(), self.clone());
        self.enqueue_task(move |lp| {
            if !state.is_cancelled() {
                lp.insert_timer(state, delay, interval, None, Box::new(callback));
            }
            Ok(())
        });

        timer
    }

    pub(crate) fn next_timer_id(&self) -> u64 {
        self.shared.next_timer.fetch_add(1, Ordering::Relaxed)
    }

    /// Takes a liveness reference on the loop.
    pub fn pin(&self) {
        self.shared.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a liveness reference.
    ///
    /// Reaching zero wakes the loop so it can re-check its exit condition.
    /// An unmatched unpin is reported and the count stays at zero.
    pub fn unpin(&self) {
        let previous = self
            .shared
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pins| Some((pins - 1).max(0)))
            .unwrap_or_else(|pins| pins);

        if previous <= 0 {
            warn!(pins = previous, "unpin without a matching pin");
        }
        if previous <= 1 {
            self.shared.waker.wake();
        }
    }

    /// Current pin count.
    pub fn pin_count(&self) -> i64 {
        self.shared.pins.load(Ordering::Acquire)
    }

    /// Interrupts the loop's poll without queuing anything.
    pub fn wake(&self) {
        self.shared.waker.wake();
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.shared.waker.clone()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("pins", &self.pin_count())
            .field("queued", &self.shared.tasks.len())
            .finish()
    }
}
