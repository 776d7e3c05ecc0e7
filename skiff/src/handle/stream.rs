use super::{Handle, HandleId, HandleKind, ReadCallback, ReadEvent, ReadSlot, WriteCallback};
use super::not_capable;
use crate::error::{Errno, OsError, ScriptResult};
use crate::runtime::{InputStream, OutputStream};
use crate::scheduler::{EventLoop, Payload, PortId};

use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc;
use tracing::trace;

/// Size of one read from a blocking stream.
const READ_CHUNK: usize = 8192;

/// Chunks a reader thread may have posted but the loop not yet received.
pub const READ_AHEAD: usize = 4;

type Source = Box<dyn Read + Send>;
type Sink = Box<dyn Write + Send>;

#[derive(Default)]
struct GateState {
    paused: bool,
    stopped: bool,
    in_flight: usize,
}

/// Flow control between the loop and a reader thread.
///
/// The reader blocks before each read while reading is paused or while
/// [`READ_AHEAD`] chunks are still on their way to the loop.
#[derive(Default)]
struct ReadGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl ReadGate {
    /// Waits until another read is allowed. `false` once the handle closed.
    fn acquire(&self) -> bool {
        let mut state = self.state.lock();

        while !state.stopped && (state.paused || state.in_flight >= READ_AHEAD) {
            self.changed.wait(&mut state);
        }

        if state.stopped {
            return false;
        }
        state.in_flight += 1;
        true
    }

    fn received(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.changed.notify_one();
    }

    fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
        self.changed.notify_one();
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
        self.changed.notify_one();
    }
}

/// A queued write; `None` data is a half-close.
struct WriteJob {
    data: Option<Vec<u8>>,
    port: PortId,
}

/// A handle bridging a blocking reader or writer onto the loop.
///
/// Used for child-process pipes, file streams, and the console. Reads run
/// on a dedicated thread of the script pool and post chunks back to the
/// loop; writes are performed in order by a dedicated writer thread.
///
/// While reading, and while any write is outstanding, the handle pins the
/// loop.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Rc<StreamInner>,
}

struct StreamInner {
    id: HandleId,
    kind: HandleKind,

    /// Reader not yet handed to its thread.
    source: RefCell<Option<Source>>,
    /// Writer not yet handed to its thread.
    sink: RefCell<Option<Sink>>,

    readable: bool,
    writable: bool,

    writer: RefCell<Option<mpsc::Sender<WriteJob>>>,
    outstanding: Cell<usize>,

    read_port: Cell<Option<PortId>>,
    reading: Cell<bool>,
    finished: Cell<bool>,
    /// Events that arrived while reading was stopped.
    backlog: RefCell<VecDeque<ReadEvent>>,
    on_read: ReadSlot,

    gate: Arc<ReadGate>,
    closed: Cell<bool>,
}

impl StreamHandle {
    fn open(lp: &mut EventLoop, kind: HandleKind, source: Option<Source>, sink: Option<Sink>) -> Self {
        let handle = Self {
            inner: Rc::new(StreamInner {
                id: lp.next_handle_id(),
                kind,
                readable: source.is_some(),
                writable: sink.is_some(),
                source: RefCell::new(source),
                sink: RefCell::new(sink),
                writer: RefCell::new(None),
                outstanding: Cell::new(0),
                read_port: Cell::new(None),
                reading: Cell::new(false),
                finished: Cell::new(false),
                backlog: RefCell::new(VecDeque::new()),
                on_read: ReadSlot::default(),
                gate: Arc::new(ReadGate::default()),
                closed: Cell::new(false),
            }),
        };

        lp.register_handle(Box::new(handle.clone()));
        handle
    }

    /// A readable stream over `source`.
    pub fn reader<R>(lp: &mut EventLoop, kind: HandleKind, source: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::open(lp, kind, Some(Box::new(source)), None)
    }

    /// A writable stream over `sink`.
    pub fn writer<W>(lp: &mut EventLoop, kind: HandleKind, sink: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self::open(lp, kind, None, Some(Box::new(sink)))
    }

    pub(crate) fn console_reader(lp: &mut EventLoop, input: InputStream) -> Self {
        Self::reader(lp, HandleKind::Console, input)
    }

    pub(crate) fn console_writer(lp: &mut EventLoop, output: OutputStream) -> Self {
        Self::writer(lp, HandleKind::Console, output)
    }

    fn enqueue(&self, lp: &mut EventLoop, data: Option<Vec<u8>>, on_complete: WriteCallback) -> Result<(), OsError> {
        let inner = &self.inner;
        let syscall = if data.is_some() { "write" } else { "shutdown" };

        if inner.closed.get() {
            return Err(OsError::new(Errno::BadDescriptor, syscall));
        }
        if !inner.writable {
            return Err(not_capable(syscall));
        }

        if inner.writer.borrow().is_none() {
            self.start_writer(lp)?;
        }

        let owner = self.clone();
        let port = lp.open_port(move |lp, payload| {
            let inner = &owner.inner;
            inner.outstanding.set(inner.outstanding.get().saturating_sub(1));

            let result = match payload.downcast::<Result<(), OsError>>() {
                Ok(result) => *result,
                Err(_) => Err(OsError::new(Errno::Io, "write")),
            };
            on_complete(lp, result)
        });

        inner.outstanding.set(inner.outstanding.get() + 1);
        lp.pin();

        let sent = match inner.writer.borrow().as_ref() {
            Some(sender) => sender.send(WriteJob { data, port }).is_ok(),
            None => false,
        };

        if !sent {
            lp.unpin();
            let failure: Result<(), OsError> = Err(OsError::new(Errno::BrokenPipe, syscall));
            lp.defer(move |lp| lp.deliver(port, Box::new(failure)));
        }

        Ok(())
    }

    fn start_writer(&self, lp: &mut EventLoop) -> Result<(), OsError> {
        let Some(mut sink) = self.inner.sink.borrow_mut().take() else {
            return Err(OsError::new(Errno::BrokenPipe, "write"));
        };

        let (sender, receiver) = mpsc::channel::<WriteJob>();
        let handle = lp.handle();
        let id = self.inner.id;

        let job = move || {
            let mut open = true;

            for job in receiver {
                let result = match (open, job.data) {
                    (false, _) => Err(OsError::new(Errno::BrokenPipe, "write")),
                    (true, Some(data)) => sink
                        .write_all(&data)
                        .and_then(|()| sink.flush())
                        .map_err(|e| write_error(&e)),
                    (true, None) => {
                        open = false;
                        let flushed = sink.flush().map_err(|e| write_error(&e));
                        sink = Box::new(io::sink());
                        flushed
                    }
                };

                handle.post(job.port, Box::new(result));
                handle.unpin();
            }

            trace!(handle = id, "stream writer finished");
        };

        lp.script_pool()
            .submit(job)
            .map_err(|_| OsError::new(Errno::Io, "write"))?;

        *self.inner.writer.borrow_mut() = Some(sender);
        Ok(())
    }

    fn start_reader(&self, lp: &mut EventLoop) -> Result<(), OsError> {
        let Some(mut source) = self.inner.source.borrow_mut().take() else {
            return Err(OsError::new(Errno::BadDescriptor, "read"));
        };

        let owner = self.clone();
        let port = lp.open_stream_port(Rc::new(move |lp: &mut EventLoop, payload: Payload| {
            match payload.downcast::<ReadEvent>() {
                Ok(event) => owner.receive(lp, *event),
                Err(_) => Ok(()),
            }
        }));

        let handle = lp.handle();
        let gate = self.inner.gate.clone();

        let job = move || {
            let mut buffer = vec![0u8; READ_CHUNK];

            while gate.acquire() {
                match source.read(&mut buffer) {
                    Ok(0) => {
                        handle.post(port, Box::new(ReadEvent::Eof));
                        break;
                    }
                    Ok(n) => handle.post(port, Box::new(ReadEvent::Data(buffer[..n].to_vec()))),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        gate.received();
                        continue;
                    }
                    Err(e) => {
                        let err = OsError::from_io("read", &e);
                        handle.post(port, Box::new(ReadEvent::Error(err)));
                        break;
                    }
                }
            }
        };

        if lp.script_pool().submit(job).is_err() {
            lp.close_port(port);
            return Err(OsError::new(Errno::Io, "read"));
        }

        self.inner.read_port.set(Some(port));
        Ok(())
    }

    /// A chunk or terminal event from the reader thread.
    fn receive(&self, lp: &mut EventLoop, event: ReadEvent) -> ScriptResult {
        let inner = &self.inner;
        inner.gate.received();

        if inner.closed.get() {
            return Ok(());
        }

        if !inner.reading.get() {
            inner.backlog.borrow_mut().push_back(event);
            return Ok(());
        }

        if !inner.backlog.borrow().is_empty() {
            inner.backlog.borrow_mut().push_back(event);
            return self.drain_backlog(lp);
        }

        self.deliver(lp, event)
    }

    fn deliver(&self, lp: &mut EventLoop, event: ReadEvent) -> ScriptResult {
        let inner = &self.inner;

        if matches!(event, ReadEvent::Eof | ReadEvent::Error(_)) {
            inner.finished.set(true);
            inner.reading.set(false);
            lp.unpin();

            if let Some(port) = inner.read_port.take() {
                lp.close_port(port);
            }
        }

        inner.on_read.dispatch(lp, event)
    }

    /// Replays events that arrived while reading was stopped.
    fn drain_backlog(&self, lp: &mut EventLoop) -> ScriptResult {
        loop {
            if !self.inner.reading.get() {
                return Ok(());
            }

            let Some(event) = self.inner.backlog.borrow_mut().pop_front() else {
                return Ok(());
            };

            self.deliver(lp, event)?;
        }
    }

    /// Events received while reading was stopped and not yet delivered.
    pub fn buffered(&self) -> usize {
        self.inner.backlog.borrow().len()
    }
}

fn write_error(err: &io::Error) -> OsError {
    match err.kind() {
        io::ErrorKind::BrokenPipe => OsError::new(Errno::Eof, "write"),
        _ => OsError::from_io("write", err),
    }
}

impl Handle for StreamHandle {
    fn id(&self) -> HandleId {
        self.inner.id
    }

    fn kind(&self) -> HandleKind {
        self.inner.kind
    }

    fn write(&self, lp: &mut EventLoop, data: Vec<u8>, on_complete: WriteCallback) -> Result<(), OsError> {
        self.enqueue(lp, Some(data), on_complete)
    }

    fn shutdown(&self, lp: &mut EventLoop, on_complete: WriteCallback) -> Result<(), OsError> {
        self.enqueue(lp, None, on_complete)
    }

    fn start_reading(&self, lp: &mut EventLoop, on_read: ReadCallback) -> Result<(), OsError> {
        let inner = &self.inner;

        if inner.closed.get() {
            return Err(OsError::new(Errno::BadDescriptor, "read"));
        }
        if !inner.readable {
            return Err(not_capable("read"));
        }

        inner.on_read.set(on_read);

        if inner.reading.get() {
            return Ok(());
        }

        if inner.finished.get() {
            return Ok(());
        }

        inner.reading.set(true);
        inner.gate.set_paused(false);
        lp.pin();

        if inner.read_port.get().is_none() {
            if let Err(err) = self.start_reader(lp) {
                inner.reading.set(false);
                lp.unpin();
                return Err(err);
            }
        } else if !inner.backlog.borrow().is_empty() {
            let owner = self.clone();
            lp.defer(move |lp| owner.drain_backlog(lp));
        }

        Ok(())
    }

    fn stop_reading(&self, lp: &mut EventLoop) {
        if self.inner.reading.replace(false) {
            self.inner.gate.set_paused(true);
            lp.unpin();
        }
    }

    fn writes_outstanding(&self) -> usize {
        self.inner.outstanding.get()
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    fn close(&self, lp: &mut EventLoop) {
        let inner = &self.inner;

        if inner.closed.replace(true) {
            return;
        }

        inner.gate.stop();

        // Queued writes still complete; the writer exits once drained.
        inner.writer.borrow_mut().take();
        inner.sink.borrow_mut().take();
        inner.source.borrow_mut().take();

        if inner.reading.replace(false) {
            lp.unpin();
        }
        if let Some(port) = inner.read_port.take() {
            lp.close_port(port);
        }

        inner.backlog.borrow_mut().clear();
        inner.on_read.clear();
        lp.unregister_handle(inner.id);
    }
}
