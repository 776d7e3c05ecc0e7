use super::EventLoop;
use super::queue::{Domain, LoopHandle};
use crate::error::ScriptResult;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

pub(crate) type TimerCallback = Box<dyn FnMut(&mut EventLoop) -> ScriptResult>;

/// Flags shared between a heap entry and every [`Timer`] handle for it.
pub(crate) struct TimerState {
    id: u64,
    cancelled: AtomicBool,
    /// Whether the timer still holds a pin on the loop.
    pinned: AtomicBool,
}

impl TimerState {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            cancelled: AtomicBool::new(false),
            pinned: AtomicBool::new(true),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Drops the timer's pin, once.
    pub(crate) fn release(&self, handle: &LoopHandle) {
        if self.pinned.swap(false, AtomicOrdering::AcqRel) {
            handle.unpin();
        }
    }
}

/// Handle to a scheduled timer.
///
/// A timer keeps the loop alive until it fires for the last time, is
/// cancelled, or is [unref'd](Timer::unref). Handles are cheap to clone and
/// may be used from any thread.
#[derive(Clone)]
pub struct Timer {
    state: Arc<TimerState>,
    handle: LoopHandle,
}

impl Timer {
    pub(crate) fn new(state: Arc<TimerState>, handle: LoopHandle) -> Self {
        Self { state, handle }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Cancels the timer. Idempotent.
    ///
    /// The heap entry is left in place and skipped when it comes due.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, AtomicOrdering::AcqRel) {
            self.state.release(&self.handle);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Stops this timer from keeping the loop alive. It still fires if the
    /// loop is running for other reasons.
    pub fn unref(&self) {
        self.state.release(&self.handle);
    }
}

/// An entry in the loop's timer heap.
pub(crate) struct TimerEntry {
    /// The time at which the timer should fire.
    pub(crate) deadline: Instant,

    /// Submission order; breaks ties between equal deadlines.
    pub(crate) sequence: u64,

    /// Re-arm period for repeating timers.
    pub(crate) interval: Option<Duration>,

    pub(crate) state: Arc<TimerState>,

    pub(crate) domain: Option<Domain>,

    pub(crate) callback: TimerCallback,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Ord for TimerEntry {
    /// Orders entries by deadline, then by submission sequence.
    ///
    /// The comparison is **reversed** so that a `BinaryHeap<TimerEntry>`
    /// pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of timers, touched only by the loop thread.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_sequence: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    /// Inserts `entry`, stamping it with the next submission sequence.
    pub(crate) fn push(&mut self, mut entry: TimerEntry) {
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(entry);
    }

    /// Earliest deadline in the heap, cancelled entries included.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pops the earliest entry if it is due at `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerEntry> {
        if self.heap.peek()?.deadline <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(deadline: Instant, id: u64) -> TimerEntry {
        TimerEntry {
            deadline,
            sequence: 0,
            interval: None,
            state: TimerState::new(id),
            domain: None,
            callback: Box::new(|_| Ok(())),
        }
    }

    #[test]
    fn equal_deadlines_pop_in_submission_order() {
        let base = Instant::now();
        let mut queue = TimerQueue::new();

        queue.push(entry(base + Duration::from_millis(100), 1));
        queue.push(entry(base + Duration::from_millis(50), 2));
        queue.push(entry(base + Duration::from_millis(100), 3));

        let later = base + Duration::from_millis(200);
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_expired(later))
            .map(|e| e.state.id)
            .collect();

        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn pop_expired_respects_now() {
        let base = Instant::now();
        let mut queue = TimerQueue::new();
        queue.push(entry(base + Duration::from_secs(10), 1));

        assert!(queue.pop_expired(base).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(base + Duration::from_secs(10)));
    }
}
