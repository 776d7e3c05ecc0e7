//! The event loop scheduler.
//!
//! One [`EventLoop`] drives all script-visible execution of a session on a
//! single thread. Other threads affect it only through a [`LoopHandle`],
//! which enqueues tasks and adjusts the pin count.
//!
//! Each turn of the loop runs, in order:
//!
//! 1. the tick queue, to exhaustion,
//! 2. the task queue (cross-thread tasks and loop-local deferred work),
//! 3. one batch of immediates,
//! 4. a reactor poll bounded by the computed timeout,
//! 5. dispatch of every ready I/O source,
//! 6. every timer whose deadline has passed.
//!
//! The loop exits once no work is queued and the pin count is zero.
//! Timers only keep it alive through the pins they hold.

mod queue;
mod timer;

pub use queue::{Domain, LoopHandle, Task};
pub use timer::Timer;

pub(crate) use queue::{Payload, PortId};

use timer::{TimerCallback, TimerEntry, TimerQueue, TimerState};

use crate::error::{Errno, OsError, ScriptError, ScriptResult};
use crate::fs::{CursorChain, Filesystem, FsCore};
use crate::handle::{Handle, HandleId, StreamHandle};
use crate::process::{self, ChildProcess, ProcessExit, ProcessInfo};
use crate::reactor::{Poller, Reactor, SocketHandle};
use crate::runtime::{
    Environment, NetworkPolicy, Sandbox, Script, ScriptOptions, ScriptStatus, SessionContext,
    WorkerPool,
};

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// A callback run on the loop thread.
pub type Callback = Box<dyn FnOnce(&mut EventLoop) -> ScriptResult>;

type FatalHandler = Box<dyn FnMut(&mut EventLoop, &ScriptError) -> bool>;

type ExitHook = Box<dyn FnOnce(&mut EventLoop, i32) -> ScriptResult>;

type StreamReceiver = Rc<dyn Fn(&mut EventLoop, Payload) -> ScriptResult>;

/// Loop-side receiver for values posted from other threads.
enum Port {
    /// Consumed by the first delivery.
    Once(Box<dyn FnOnce(&mut EventLoop, Payload) -> ScriptResult>),

    /// Receives every delivery until closed.
    Stream(StreamReceiver),
}

/// The single-threaded scheduler of one session.
pub struct EventLoop {
    handle: LoopHandle,
    reactor: Reactor,
    timers: TimerQueue,

    ticks: VecDeque<Callback>,
    immediates: VecDeque<Callback>,

    /// Loop-local tasks, drained alongside the cross-thread queue.
    deferred: VecDeque<Callback>,

    ports: HashMap<PortId, Port>,
    next_port: PortId,

    /// Every open handle; force-closed at shutdown if still present.
    handles: HashMap<HandleId, Box<dyn Handle>>,
    next_handle: HandleId,

    fatal_handler: Option<FatalHandler>,
    exit_hooks: Vec<ExitHook>,

    /// Explicit exit code; always wins over later failures.
    exit_code: Option<i32>,

    domain: Option<Domain>,

    session: SessionContext,
    async_pool: WorkerPool,

    fs: Arc<FsCore>,
    cursor_chains: HashMap<i32, CursorChain>,

    console: [Option<StreamHandle>; 3],
}

impl EventLoop {
    pub(crate) fn new(session: SessionContext, poller: Poller) -> Self {
        let reactor = Reactor::new(poller);
        let handle = LoopHandle::new(reactor.waker());
        session.future.attach(handle.waker());

        let async_pool = session
            .sandbox
            .async_pool()
            .cloned()
            .unwrap_or_else(|| session.env.async_pool().clone());

        let fs = Arc::new(FsCore::new(session.sandbox.translator(), session.umask));

        Self {
            handle,
            reactor,
            timers: TimerQueue::new(),
            ticks: VecDeque::new(),
            immediates: VecDeque::new(),
            deferred: VecDeque::new(),
            ports: HashMap::new(),
            next_port: 1,
            handles: HashMap::new(),
            next_handle: 1,
            fatal_handler: None,
            exit_hooks: Vec::new(),
            exit_code: None,
            domain: None,
            session,
            async_pool,
            fs,
            cursor_chains: HashMap::new(),
            console: [None, None, None],
        }
    }

    /// Runs `script` and then the loop until it exits, is cancelled, or
    /// fails fatally.
    pub(crate) fn run(mut self, script: Box<dyn Script>) -> ScriptStatus {
        debug!(pid = self.session.pid, "session started");

        if self.session.pinned {
            self.handle.pin();
        }

        let status = if self.session.future.is_cancelled() {
            ScriptStatus::Cancelled
        } else {
            let outcome = script.main(&mut self);
            match self.settle(outcome) {
                Ok(_) => self.main_loop(),
                Err(err) => self.status_for(err),
            }
        };

        let status = self.finish(status);
        debug!(
            pid = self.session.pid,
            exit_code = status.exit_code(),
            "session finished"
        );

        status
    }

    fn main_loop(&mut self) -> ScriptStatus {
        loop {
            if self.session.future.is_cancelled() {
                debug!(pid = self.session.pid, "session cancelled");
                return ScriptStatus::Cancelled;
            }

            if let Err(err) = self.turn() {
                return self.status_for(err);
            }

            if !self.is_alive() {
                return match self.exit_code {
                    Some(code) => ScriptStatus::Exit(code),
                    None => ScriptStatus::Ok,
                };
            }
        }
    }

    /// One full iteration of the loop.
    fn turn(&mut self) -> ScriptResult {
        self.run_ticks()?;
        self.run_tasks()?;
        self.run_immediates()?;

        let timeout = self.poll_timeout();
        self.reactor
            .poll(timeout)
            .map_err(|e| OsError::from_io("epoll_wait", &e))?;

        self.dispatch_io()?;
        self.fire_timers()
    }

    fn is_alive(&self) -> bool {
        self.handle.has_tasks()
            || !self.deferred.is_empty()
            || !self.ticks.is_empty()
            || !self.immediates.is_empty()
            || self.handle.pin_count() > 0
    }

    /// Zero when anything is runnable or nothing pins the loop; otherwise
    /// the time to the next timer, or forever.
    fn poll_timeout(&self) -> Option<Duration> {
        let runnable = self.handle.has_tasks()
            || !self.deferred.is_empty()
            || !self.ticks.is_empty()
            || !self.immediates.is_empty();

        if runnable || self.handle.pin_count() <= 0 {
            return Some(Duration::ZERO);
        }

        self.timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn run_ticks(&mut self) -> ScriptResult {
        while let Some(tick) = self.ticks.pop_front() {
            let outcome = tick(self);
            if !self.settle(outcome)? {
                return Ok(());
            }
        }

        Ok(())
    }

    fn run_tasks(&mut self) -> ScriptResult {
        loop {
            let outcome = if let Some(callback) = self.deferred.pop_front() {
                callback(self)
            } else if let Some(task) = self.handle.pop() {
                self.invoke_in(task.domain, task.work)
            } else {
                return Ok(());
            };

            if !self.settle(outcome)? {
                return Ok(());
            }
        }
    }

    fn run_immediates(&mut self) -> ScriptResult {
        let mut batch = std::mem::take(&mut self.immediates);

        while let Some(immediate) = batch.pop_front() {
            let outcome = immediate(self);

            match self.settle(outcome) {
                Ok(true) => {}
                aborted => {
                    // Unrun immediates stay ahead of ones queued meanwhile.
                    batch.append(&mut self.immediates);
                    self.immediates = batch;
                    return aborted.map(|_| ());
                }
            }
        }

        Ok(())
    }

    fn dispatch_io(&mut self) -> ScriptResult {
        for (source, event) in self.reactor.take_ready() {
            let outcome = source.selected(self, event);
            if !self.settle(outcome)? {
                return Ok(());
            }
        }

        Ok(())
    }

    fn fire_timers(&mut self) -> ScriptResult {
        let now = Instant::now();
        let mut rearm = Vec::new();
        let mut result = Ok(());

        while let Some(mut entry) = self.timers.pop_expired(now) {
            if entry.state.is_cancelled() {
                continue;
            }

            let outcome = self.invoke_in(entry.domain.clone(), |lp| (entry.callback)(lp));

            match entry.interval {
                Some(interval) if !entry.state.is_cancelled() => {
                    entry.deadline = now + interval;
                    rearm.push(entry);
                }
                _ => entry.state.release(&self.handle),
            }

            match self.settle(outcome) {
                Ok(true) => {}
                aborted => {
                    result = aborted.map(|_| ());
                    break;
                }
            }
        }

        for entry in rearm {
            self.timers.push(entry);
        }

        result
    }

    fn invoke_in<F>(&mut self, domain: Option<Domain>, work: F) -> ScriptResult
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult,
    {
        let previous = std::mem::replace(&mut self.domain, domain);
        let outcome = work(self);
        self.domain = previous;

        outcome
    }

    /// Classifies a callback outcome.
    ///
    /// `Ok(true)` continues the batch, `Ok(false)` aborts it after the fatal
    /// handler dealt with the failure, and `Err` terminates the loop.
    fn settle(&mut self, outcome: ScriptResult) -> Result<bool, ScriptError> {
        match outcome {
            Ok(()) => match self.exit_code {
                Some(code) => Err(ScriptError::Exit(code)),
                None => Ok(true),
            },
            Err(err) => self.recover(err).map(|()| false),
        }
    }

    fn recover(&mut self, err: ScriptError) -> ScriptResult {
        if matches!(err, ScriptError::Exit(_)) || self.exit_code.is_some() {
            return Err(err);
        }

        let Some(mut handler) = self.fatal_handler.take() else {
            return Err(err);
        };

        let handled = handler(self, &err);
        if self.fatal_handler.is_none() {
            self.fatal_handler = Some(handler);
        }

        if handled {
            debug!(error = %err, "script error handled");
            Ok(())
        } else {
            Err(err)
        }
    }

    fn status_for(&self, err: ScriptError) -> ScriptStatus {
        match (self.exit_code, err) {
            (Some(code), _) => ScriptStatus::Exit(code),
            (None, ScriptError::Exit(code)) => ScriptStatus::Exit(code),
            (None, err) => {
                debug!(error = %err, "session failed");
                ScriptStatus::Failed(err)
            }
        }
    }

    fn finish(&mut self, status: ScriptStatus) -> ScriptStatus {
        let status = match status {
            ScriptStatus::Ok | ScriptStatus::Exit(_) => self.emit_exit(status),
            other => other,
        };

        self.close_leaked_handles();
        self.session.sandbox.release_streams();

        status
    }

    fn emit_exit(&mut self, mut status: ScriptStatus) -> ScriptStatus {
        for hook in std::mem::take(&mut self.exit_hooks) {
            if let Err(err) = hook(self, status.exit_code()) {
                return self.status_for(err);
            }

            if let Some(code) = self.exit_code {
                status = ScriptStatus::Exit(code);
            }
        }

        status
    }

    fn close_leaked_handles(&mut self) {
        let leaked: Vec<_> = self.handles.drain().collect();

        for (id, handle) in leaked {
            debug!(handle = id, kind = ?handle.kind(), "closing leaked handle");
            handle.close(self);
        }
    }

    /// A thread-safe handle for enqueuing work from other threads.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Queues a task; see [`LoopHandle::enqueue_task`].
    pub fn enqueue_task<F>(&self, task: F)
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult + Send + 'static,
    {
        self.handle.enqueue_task(task);
    }

    /// Queues a loop-local callback behind the current task queue.
    ///
    /// Unlike [`EventLoop::enqueue_task`] the callback need not be `Send`.
    pub fn defer<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult + 'static,
    {
        self.deferred.push_back(Box::new(callback));
    }

    /// Schedules a microtask, run before any I/O of the next turn.
    pub fn next_tick<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult + 'static,
    {
        self.ticks.push_back(Box::new(callback));
    }

    /// Schedules a callback for the next immediate batch.
    pub fn set_immediate<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult + 'static,
    {
        self.immediates.push_back(Box::new(callback));
    }

    /// Creates a timer firing after `delay`, then every `interval` if given.
    ///
    /// The timer inherits the current domain.
    pub fn create_timer<F>(&mut self, delay: Duration, interval: Option<Duration>, callback: F) -> Timer
    where
        F: FnMut(&mut EventLoop) -> ScriptResult + 'static,
    {
        let state = TimerState::new(self.handle.next_timer_id());
        self.handle.pin();

        let domain = self.domain.clone();
        self.insert_timer(state.clone(), delay, interval, domain, Box::new(callback));

        Timer::new(state, self.handle.clone())
    }

    /// One-shot timer.
    pub fn set_timeout<F>(&mut self, delay: Duration, callback: F) -> Timer
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult + 'static,
    {
        let mut callback = Some(callback);

        self.create_timer(delay, None, move |lp| match callback.take() {
            Some(callback) => callback(lp),
            None => Ok(()),
        })
    }

    /// Repeating timer whose first firing is one `interval` away.
    pub fn set_interval<F>(&mut self, interval: Duration, callback: F) -> Timer
    where
        F: FnMut(&mut EventLoop) -> ScriptResult + 'static,
    {
        self.create_timer(interval, Some(interval), callback)
    }

    pub(crate) fn insert_timer(
        &mut self,
        state: Arc<TimerState>,
        delay: Duration,
        interval: Option<Duration>,
        domain: Option<Domain>,
        callback: TimerCallback,
    ) {
        self.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            sequence: 0,
            interval,
            state,
            domain,
            callback,
        });
    }

    pub fn pin(&self) {
        self.handle.pin();
    }

    pub fn unpin(&self) {
        self.handle.unpin();
    }

    /// Records an explicit exit code and returns the error to propagate.
    ///
    /// ```rust,ignore
    /// return Err(lp.exit(3));
    /// ```
    pub fn exit(&mut self, code: i32) -> ScriptError {
        self.exit_code = Some(code);
        ScriptError::Exit(code)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Installs the hook consulted for every failure escaping a callback.
    ///
    /// Returning `true` marks the failure handled and the loop resumes.
    pub fn set_fatal_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut EventLoop, &ScriptError) -> bool + 'static,
    {
        self.fatal_handler = Some(Box::new(handler));
    }

    /// Registers a hook run with the exit code when the loop ends normally.
    pub fn on_exit<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut EventLoop, i32) -> ScriptResult + 'static,
    {
        self.exit_hooks.push(Box::new(hook));
    }

    /// The domain of the currently running task or timer.
    pub fn domain(&self) -> Option<&Domain> {
        self.domain.as_ref()
    }

    /// Runs `op` on the async worker pool and delivers its result to
    /// `handler` on the loop thread.
    ///
    /// The loop stays pinned while the operation is outstanding. If the
    /// pool rejects the work the handler still runs, with `EIO`.
    pub fn run_async<T, Op, H>(&mut self, syscall: &'static str, op: Op, handler: H)
    where
        T: Send + 'static,
        Op: FnOnce() -> Result<T, OsError> + Send + 'static,
        H: FnOnce(&mut EventLoop, Result<T, OsError>) -> ScriptResult + 'static,
    {
        let port = self.open_port(move |lp, payload| {
            let result = match payload.downcast::<Result<T, OsError>>() {
                Ok(result) => *result,
                Err(_) => Err(OsError::new(Errno::Io, syscall)),
            };
            handler(lp, result)
        });

        self.handle.pin();
        let handle = self.handle.clone();

        let job = move || {
            let result = panic::catch_unwind(AssertUnwindSafe(op)).unwrap_or_else(|_| {
                error!(syscall, "async operation panicked");
                Err(OsError::new(Errno::Io, syscall))
            });

            handle.post(port, Box::new(result));
            handle.unpin();
        };

        if let Err(err) = self.async_pool.submit(job) {
            warn!(syscall, error = %err, "async operation rejected");
            self.handle.unpin();

            let failure: Result<T, OsError> = Err(OsError::new(Errno::Io, syscall));
            self.defer(move |lp| lp.deliver(port, Box::new(failure)));
        }
    }

    pub(crate) fn open_port<F>(&mut self, receiver: F) -> PortId
    where
        F: FnOnce(&mut EventLoop, Payload) -> ScriptResult + 'static,
    {
        self.insert_port(Port::Once(Box::new(receiver)))
    }

    pub(crate) fn open_stream_port(&mut self, receiver: StreamReceiver) -> PortId {
        self.insert_port(Port::Stream(receiver))
    }

    fn insert_port(&mut self, port: Port) -> PortId {
        let id = self.next_port;
        self.next_port += 1;
        self.ports.insert(id, port);

        id
    }

    pub(crate) fn close_port(&mut self, id: PortId) {
        self.ports.remove(&id);
    }

    pub(crate) fn deliver(&mut self, id: PortId, payload: Payload) -> ScriptResult {
        match self.ports.remove(&id) {
            Some(Port::Once(receiver)) => receiver(self, payload),
            Some(Port::Stream(receiver)) => {
                self.ports.insert(id, Port::Stream(receiver.clone()));
                receiver(self, payload)
            }
            None => {
                trace!(port = id, "dropping payload for closed port");
                Ok(())
            }
        }
    }

    pub(crate) fn next_handle_id(&mut self) -> HandleId {
        let id = self.next_handle;
        self.next_handle += 1;

        id
    }

    pub(crate) fn register_handle(&mut self, handle: Box<dyn Handle>) {
        trace!(handle = handle.id(), kind = ?handle.kind(), "handle opened");
        self.handles.insert(handle.id(), handle);
    }

    pub(crate) fn unregister_handle(&mut self, id: HandleId) {
        if self.handles.remove(&id).is_some() {
            trace!(handle = id, "handle closed");
        }
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    pub(crate) fn async_pool(&self) -> &WorkerPool {
        &self.async_pool
    }

    pub(crate) fn script_pool(&self) -> &WorkerPool {
        self.session.env.script_pool()
    }

    pub(crate) fn fs_core(&self) -> &Arc<FsCore> {
        &self.fs
    }

    pub(crate) fn cursor_chains(&mut self) -> &mut HashMap<i32, CursorChain> {
        &mut self.cursor_chains
    }

    pub(crate) fn network_policy(&self) -> Option<Arc<dyn NetworkPolicy>> {
        self.session.sandbox.network_policy().cloned()
    }

    /// Filesystem operations of this session.
    pub fn fs(&mut self) -> Filesystem<'_> {
        Filesystem::new(self)
    }

    /// A new, unbound TCP handle.
    pub fn tcp(&mut self) -> SocketHandle {
        SocketHandle::new(self)
    }

    /// Spawns an OS process or a nested session; see [`crate::process`].
    pub fn spawn<F>(&mut self, info: ProcessInfo, on_exit: F) -> Result<ChildProcess, OsError>
    where
        F: FnOnce(&mut EventLoop, ProcessExit) -> ScriptResult + 'static,
    {
        process::spawn(self, info, Box::new(on_exit))
    }

    /// Console handle over the sandbox's stdin.
    pub fn stdin(&mut self) -> StreamHandle {
        self.console(0)
    }

    /// Console handle over the sandbox's stdout.
    pub fn stdout(&mut self) -> StreamHandle {
        self.console(1)
    }

    /// Console handle over the sandbox's stderr.
    pub fn stderr(&mut self) -> StreamHandle {
        self.console(2)
    }

    fn console(&mut self, fd: usize) -> StreamHandle {
        if let Some(handle) = &self.console[fd] {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let sandbox = &self.session.sandbox;
        let handle = match fd {
            0 => {
                let input = sandbox.stdin().clone();
                StreamHandle::console_reader(self, input)
            }
            1 => {
                let output = sandbox.stdout().clone();
                StreamHandle::console_writer(self, output)
            }
            _ => {
                let output = sandbox.stderr().clone();
                StreamHandle::console_writer(self, output)
            }
        };

        self.console[fd] = Some(handle.clone());
        handle
    }

    /// The environment this session runs in.
    pub fn environment(&self) -> &Environment {
        &self.session.env
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.session.sandbox
    }

    pub fn options(&self) -> &ScriptOptions {
        &self.session.options
    }

    /// Script-visible argv: the executable name, then the script path and
    /// its arguments verbatim.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.session.env.executable_name().to_string()];
        argv.extend(self.session.options.args.iter().cloned());

        argv
    }

    /// Environment variables visible to the script and its children.
    pub fn env_vars(&self) -> &HashMap<String, String> {
        &self.session.vars
    }

    pub fn pid(&self) -> u32 {
        self.session.pid
    }

    /// Whether the parent opened an ipc channel for this session.
    pub fn ipc_enabled(&self) -> bool {
        self.session.ipc
    }

    /// The script-visible working directory.
    pub fn working_directory(&self) -> String {
        self.fs.working_directory()
    }

    /// Changes the working directory; the target must be a directory.
    pub fn chdir(&mut self, path: &str) -> Result<(), OsError> {
        self.fs.chdir(path)
    }

    pub fn umask(&self) -> u32 {
        self.fs.umask()
    }

    /// Replaces the umask and returns the previous one.
    pub fn set_umask(&self, mask: u32) -> u32 {
        self.fs.set_umask(mask)
    }
}
