use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Why a pool refused a job.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every thread is busy and the queue is full.
    #[error("worker pool saturated")]
    Saturated,

    #[error("worker pool shut down")]
    Shutdown,

    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A pool of blocking worker threads.
///
/// Threads are spawned on demand up to a maximum and retire after sitting
/// idle for the configured timeout. A bounded pool queues a limited number
/// of jobs once every thread is busy and rejects the rest; an unbounded
/// pool spawns a thread for every job no idle thread can take.
///
/// A panicking job is logged and does not take its thread down.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    max_threads: usize,
    /// `None` never rejects.
    queue_limit: Option<usize>,
    idle_timeout: Duration,

    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    threads: usize,
    idle: usize,
    spawned: u64,
    shutdown: bool,
}

impl WorkerPool {
    /// At most `max_threads` threads and `queue` waiting jobs.
    pub fn bounded(name: impl Into<String>, max_threads: usize, queue: usize, idle_timeout: Duration) -> Self {
        Self::with_limits(name.into(), max_threads.max(1), Some(queue), idle_timeout)
    }

    /// Never rejects; every job runs as soon as a thread can be found.
    pub fn unbounded(name: impl Into<String>, idle_timeout: Duration) -> Self {
        Self::with_limits(name.into(), usize::MAX, None, idle_timeout)
    }

    fn with_limits(name: String, max_threads: usize, queue_limit: Option<usize>, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                max_threads,
                queue_limit,
                idle_timeout,
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Schedules `job`.
    ///
    /// # Errors
    ///
    /// [`PoolError::Saturated`] if a bounded pool has no thread and no
    /// queue slot left, [`PoolError::Shutdown`] after [`WorkerPool::shutdown`].
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.shutdown {
            return Err(PoolError::Shutdown);
        }

        if state.idle > state.queue.len() {
            state.queue.push_back(Box::new(job));
            inner.available.notify_one();
            return Ok(());
        }

        if state.threads < inner.max_threads {
            let id = state.spawned;
            let pool = Arc::clone(inner);
            let first: Job = Box::new(job);

            thread::Builder::new()
                .name(format!("{}-{id}", inner.name))
                .spawn(move || worker(pool, first))
                .map_err(PoolError::Spawn)?;

            state.threads += 1;
            state.spawned += 1;
            return Ok(());
        }

        match inner.queue_limit {
            Some(limit) if state.queue.len() >= limit => Err(PoolError::Saturated),
            _ => {
                state.queue.push_back(Box::new(job));
                Ok(())
            }
        }
    }

    /// Stops accepting jobs. Queued jobs still run.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.available.notify_all();
    }

    /// Live worker threads.
    pub fn threads(&self) -> usize {
        self.inner.state.lock().threads
    }

    /// Jobs waiting for a thread.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("threads", &state.threads)
            .field("idle", &state.idle)
            .field("queued", &state.queue.len())
            .finish()
    }
}

fn worker(pool: Arc<PoolInner>, first: Job) {
    run(&pool.name, first);

    let mut state = pool.state.lock();
    loop {
        if let Some(job) = state.queue.pop_front() {
            drop(state);
            run(&pool.name, job);
            state = pool.state.lock();
            continue;
        }

        if state.shutdown {
            break;
        }

        state.idle += 1;
        let timed_out = pool.available.wait_for(&mut state, pool.idle_timeout).timed_out();
        state.idle -= 1;

        if timed_out && state.queue.is_empty() {
            break;
        }
    }

    state.threads -= 1;
    trace!(pool = %pool.name, "worker retired");
}

fn run(pool: &str, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(pool, "worker job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn bounded_pool_rejects_when_saturated() {
        let pool = WorkerPool::bounded("test", 1, 1, Duration::from_secs(5));
        let (release, gate) = mpsc::channel::<()>();
        let (started, running) = mpsc::channel();

        pool.submit(move || {
            started.send(()).unwrap();
            gate.recv().unwrap();
        })
        .unwrap();
        running.recv().unwrap();

        pool.submit(|| {}).unwrap();
        assert_eq!(pool.queued(), 1);

        assert!(matches!(pool.submit(|| {}), Err(PoolError::Saturated)));
        release.send(()).unwrap();
    }

    #[test]
    fn unbounded_pool_runs_jobs_concurrently() {
        let pool = WorkerPool::unbounded("test", Duration::from_secs(5));
        let (done, finished) = mpsc::channel();
        let barrier = Arc::new(std::sync::Barrier::new(4));

        for _ in 0..4 {
            let barrier = barrier.clone();
            let done = done.clone();
            pool.submit(move || {
                barrier.wait();
                done.send(()).unwrap();
            })
            .unwrap();
        }

        for _ in 0..4 {
            finished.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn panicking_job_keeps_the_pool_usable() {
        let pool = WorkerPool::bounded("test", 1, 4, Duration::from_secs(5));
        let count = Arc::new(AtomicUsize::new(0));
        let (done, finished) = mpsc::channel();

        pool.submit(|| panic!("boom")).unwrap();

        let seen = count.clone();
        pool.submit(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            done.send(()).unwrap();
        })
        .unwrap();

        finished.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let pool = WorkerPool::unbounded("test", Duration::from_secs(5));
        pool.shutdown();

        assert!(matches!(pool.submit(|| {}), Err(PoolError::Shutdown)));
    }
}
