use super::core::Selectable;
use super::event::Event;
use super::poller::Interest;
use super::poller::platform::{
    sys_accept, sys_bind, sys_close, sys_connect, sys_ipv6_is_necessary, sys_listen, sys_peername,
    sys_read, sys_send, sys_set_keepalive, sys_set_nodelay, sys_set_nonblocking, sys_set_reuseaddr,
    sys_shutdown, sys_socket, sys_socket_error, sys_sockname,
};
use crate::error::{Errno, OsError, ScriptResult};
use crate::handle::{
    Handle, HandleId, HandleKind, ReadCallback, ReadEvent, ReadSlot, WriteCallback, not_capable,
};
use crate::scheduler::EventLoop;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::rc::Rc;
use tracing::{debug, error, trace};

/// Upper bound of a single read on a socket.
const READ_BUFFER: usize = 32767;

/// Receives each connection accepted by a listening socket.
type ConnectionCallback = Box<dyn FnMut(&mut EventLoop, SocketHandle) -> ScriptResult>;

/// Completion of [`SocketHandle::connect`].
type ConnectCallback = Box<dyn FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closed,
}

/// A local or remote socket address as scripts see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddress {
    pub address: String,
    pub port: u16,
    /// `"IPv4"` or `"IPv6"`.
    pub family: &'static str,
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
            family: if addr.is_ipv4() { "IPv4" } else { "IPv6" },
        }
    }
}

/// A pending write; `data` of `None` is a half-close.
struct QueuedWrite {
    data: Option<Vec<u8>>,
    offset: usize,
    on_complete: WriteCallback,
}

/// A non-blocking TCP socket driven by the loop's reactor.
///
/// A socket starts unbound. [`bind`](SocketHandle::bind) followed by
/// [`listen`](SocketHandle::listen) turns it into a server whose accepted
/// children are connected sockets of their own;
/// [`connect`](SocketHandle::connect) turns it into a client.
///
/// Writes are queued per socket and complete strictly in order. Reads
/// deliver one bounded chunk per readiness event.
#[derive(Clone)]
pub struct SocketHandle {
    inner: Rc<SocketInner>,
}

struct SocketInner {
    id: HandleId,
    phase: Cell<Phase>,

    fd: Cell<Option<RawFd>>,
    token: Cell<Option<usize>>,
    interest: Cell<Interest>,

    /// Address recorded by `bind`, used by `listen` and as the local end of
    /// a later `connect`.
    bound: Cell<Option<SocketAddr>>,

    on_connection: RefCell<Option<ConnectionCallback>>,
    on_connect: RefCell<Option<ConnectCallback>>,

    writes: RefCell<VecDeque<QueuedWrite>>,
    /// Set while the head write waits for writability.
    write_blocked: Cell<bool>,

    reading: Cell<bool>,
    eof: Cell<bool>,
    on_read: ReadSlot,
    read_buffer: RefCell<Vec<u8>>,

    /// Liveness references this socket holds on the loop.
    pins: Cell<usize>,
}

impl SocketHandle {
    pub(crate) fn new(lp: &mut EventLoop) -> Self {
        Self::open(lp, Phase::Unbound, None)
    }

    fn open(lp: &mut EventLoop, phase: Phase, fd: Option<RawFd>) -> Self {
        let handle = Self {
            inner: Rc::new(SocketInner {
                id: lp.next_handle_id(),
                phase: Cell::new(phase),
                fd: Cell::new(fd),
                token: Cell::new(None),
                interest: Cell::new(Interest::NONE),
                bound: Cell::new(None),
                on_connection: RefCell::new(None),
                on_connect: RefCell::new(None),
                writes: RefCell::new(VecDeque::new()),
                write_blocked: Cell::new(false),
                reading: Cell::new(false),
                eof: Cell::new(false),
                on_read: ReadSlot::default(),
                read_buffer: RefCell::new(Vec::new()),
                pins: Cell::new(0),
            }),
        };

        lp.register_handle(Box::new(handle.clone()));
        handle
    }

    /// Records the local address to listen on or connect from.
    ///
    /// Nothing is bound at the OS level until `listen` or `connect`.
    pub fn bind(&self, host: &str, port: u16) -> Result<(), OsError> {
        match self.inner.phase.get() {
            Phase::Unbound | Phase::Bound => {}
            Phase::Closed => return Err(OsError::new(Errno::BadDescriptor, "bind")),
            _ => return Err(OsError::new(Errno::InvalidArgument, "bind")),
        }

        let addr = resolve(host, port).ok_or_else(|| OsError::new(Errno::NotFound, "bind"))?;

        self.inner.bound.set(Some(addr));
        self.inner.phase.set(Phase::Bound);
        Ok(())
    }

    /// Starts accepting connections on the bound address.
    ///
    /// Each accepted connection is handed to `on_connection` as a new,
    /// connected socket. The listening socket pins the loop until closed.
    pub fn listen<F>(&self, lp: &mut EventLoop, backlog: i32, on_connection: F) -> Result<(), OsError>
    where
        F: FnMut(&mut EventLoop, SocketHandle) -> ScriptResult + 'static,
    {
        let inner = &self.inner;

        let addr = match (inner.phase.get(), inner.bound.get()) {
            (Phase::Bound, Some(addr)) => addr,
            _ => return Err(OsError::new(Errno::InvalidArgument, "listen")),
        };

        if let Some(policy) = lp.network_policy() {
            if !policy.allow_listening(&addr) {
                debug!(%addr, "listening denied by network policy");
                return Err(OsError::new(Errno::InvalidArgument, "listen"));
            }
        }

        let fd = sys_socket(&addr).map_err(|_| OsError::new(Errno::Io, "listen"))?;
        if let Err(e) = setup_listener(fd, &addr, backlog) {
            sys_close(fd);
            debug!(%addr, error = %e, "listen failed");

            let errno = match e.raw_os_error() {
                Some(libc::EADDRINUSE) | Some(libc::EACCES) | Some(libc::EADDRNOTAVAIL) => {
                    Errno::AddressInUse
                }
                _ => Errno::Io,
            };
            return Err(OsError::new(errno, "listen"));
        }

        debug!(handle = inner.id, %addr, backlog, "listening");

        inner.fd.set(Some(fd));
        inner.phase.set(Phase::Listening);
        *inner.on_connection.borrow_mut() = Some(Box::new(on_connection));
        self.hold(lp);

        self.update_interest(lp).map_err(|e| OsError::from_io("listen", &e))
    }

    /// Opens a non-blocking connection to `host:port`.
    ///
    /// `on_complete` fires exactly once: `Ok` once connected, or
    /// `ECONNREFUSED`/`EIO`. A target the network policy rejects, or one
    /// that does not resolve, fails synchronously with `EINVAL`.
    pub fn connect<F>(&self, lp: &mut EventLoop, host: &str, port: u16, on_complete: F) -> Result<(), OsError>
    where
        F: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let inner = &self.inner;

        match inner.phase.get() {
            Phase::Unbound | Phase::Bound => {}
            Phase::Closed => return Err(OsError::new(Errno::BadDescriptor, "connect")),
            _ => return Err(OsError::new(Errno::InvalidArgument, "connect")),
        }

        let target =
            resolve(host, port).ok_or_else(|| OsError::new(Errno::InvalidArgument, "connect"))?;

        if let Some(policy) = lp.network_policy() {
            if !policy.allow_connection(&target) {
                debug!(%target, "connection denied by network policy");
                return Err(OsError::new(Errno::InvalidArgument, "connect"));
            }
        }

        debug!(handle = inner.id, %target, "connecting");

        let fd = sys_socket(&target).map_err(|_| OsError::new(Errno::Io, "connect"))?;
        let immediate = match start_connect(fd, inner.bound.get(), &target) {
            Ok(()) => None,
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => None,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Some(OsError::new(Errno::ConnectionRefused, "connect"))
            }
            Err(e) => {
                sys_close(fd);
                debug!(%target, error = %e, "connect failed");
                return Err(OsError::new(Errno::Io, "connect"));
            }
        };

        inner.fd.set(Some(fd));
        inner.phase.set(Phase::Connecting);
        *inner.on_connect.borrow_mut() = Some(Box::new(on_complete));
        self.hold(lp);

        match immediate {
            // Reported from the loop, never from inside `connect`.
            Some(err) => {
                let owner = self.clone();
                lp.defer(move |lp| owner.finish_connect(lp, Err(err)));
                Ok(())
            }
            None => self
                .update_interest(lp)
                .map_err(|e| OsError::from_io("connect", &e)),
        }
    }

    fn accepted(lp: &mut EventLoop, fd: RawFd) -> Self {
        let _ = sys_set_nodelay(fd, true);
        Self::open(lp, Phase::Connected, Some(fd))
    }

    pub fn set_no_delay(&self, on: bool) -> Result<(), OsError> {
        let fd = self.connected_fd("setNoDelay")?;
        sys_set_nodelay(fd, on).map_err(|e| {
            error!(handle = self.inner.id, error = %e, "setting TCP_NODELAY failed");
            OsError::new(Errno::Io, "setNoDelay")
        })
    }

    pub fn set_keep_alive(&self, on: bool) -> Result<(), OsError> {
        let fd = self.connected_fd("setKeepAlive")?;
        sys_set_keepalive(fd, on).map_err(|e| {
            error!(handle = self.inner.id, error = %e, "setting SO_KEEPALIVE failed");
            OsError::new(Errno::Io, "setKeepAlive")
        })
    }

    /// The local end of the socket, once it exists at the OS level.
    pub fn local_address(&self) -> Option<SocketAddress> {
        let fd = self.inner.fd.get()?;
        sys_sockname(fd).ok().map(SocketAddress::from)
    }

    /// The remote end of a connected socket.
    pub fn remote_address(&self) -> Option<SocketAddress> {
        if self.inner.phase.get() != Phase::Connected {
            return None;
        }
        let fd = self.inner.fd.get()?;
        sys_peername(fd).ok().map(SocketAddress::from)
    }

    fn connected_fd(&self, syscall: &'static str) -> Result<RawFd, OsError> {
        match (self.inner.phase.get(), self.inner.fd.get()) {
            (Phase::Closed, _) => Err(OsError::new(Errno::BadDescriptor, syscall)),
            (_, Some(fd)) => Ok(fd),
            (_, None) => Err(OsError::new(Errno::InvalidArgument, syscall)),
        }
    }

    fn hold(&self, lp: &mut EventLoop) {
        self.inner.pins.set(self.inner.pins.get() + 1);
        lp.pin();
    }

    fn release(&self, lp: &mut EventLoop) {
        let pins = self.inner.pins.get();
        if pins > 0 {
            self.inner.pins.set(pins - 1);
            lp.unpin();
        }
    }

    /// Brings the reactor registration in line with what the socket
    /// currently waits for, registering lazily on first use.
    fn update_interest(&self, lp: &mut EventLoop) -> io::Result<()> {
        let inner = &self.inner;
        let Some(fd) = inner.fd.get() else {
            return Ok(());
        };

        let wanted = match inner.phase.get() {
            Phase::Listening => Interest {
                read: true,
                write: false,
            },
            Phase::Connecting => Interest {
                read: false,
                write: true,
            },
            Phase::Connected => Interest {
                read: inner.reading.get(),
                write: inner.write_blocked.get(),
            },
            _ => Interest::NONE,
        };

        match inner.token.get() {
            Some(token) if wanted != inner.interest.get() => {
                lp.reactor_mut().reregister(fd, token, wanted)?;
            }
            Some(_) => {}
            None if wanted.is_empty() => {}
            None => {
                let source: Rc<dyn Selectable> = Rc::new(self.clone());
                let token = lp.reactor_mut().register(fd, source, wanted)?;
                inner.token.set(Some(token));
            }
        }

        inner.interest.set(wanted);
        Ok(())
    }

    fn finish_connect(&self, lp: &mut EventLoop, result: Result<(), OsError>) -> ScriptResult {
        let inner = &self.inner;
        let Some(on_connect) = inner.on_connect.borrow_mut().take() else {
            return Ok(());
        };

        self.release(lp);

        match &result {
            Ok(()) => {
                trace!(handle = inner.id, "connected");
                inner.phase.set(Phase::Connected);

                if !inner.writes.borrow().is_empty() {
                    self.flush_writes(lp);
                }
            }
            Err(err) => {
                debug!(handle = inner.id, error = %err, "connect failed");
                self.detach(lp);
                inner.phase.set(match inner.bound.get() {
                    Some(_) => Phase::Bound,
                    None => Phase::Unbound,
                });
                self.fail_writes(lp, Errno::Eof);
            }
        }

        if let Err(e) = self.update_interest(lp) {
            debug!(handle = inner.id, error = %e, "updating interest failed");
        }

        on_connect(lp, result)
    }

    fn process_connect(&self, lp: &mut EventLoop) -> ScriptResult {
        let Some(fd) = self.inner.fd.get() else {
            return Ok(());
        };

        let result = match sys_socket_error(fd) {
            Ok(None) => Ok(()),
            Ok(Some(e)) | Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(OsError::new(Errno::ConnectionRefused, "connect"))
            }
            Ok(Some(_)) | Err(_) => Err(OsError::new(Errno::Io, "connect")),
        };

        self.finish_connect(lp, result)
    }

    fn process_accept(&self, lp: &mut EventLoop) -> ScriptResult {
        let Some(fd) = self.inner.fd.get() else {
            return Ok(());
        };

        loop {
            if self.inner.phase.get() != Phase::Listening {
                return Ok(());
            }

            let child = match sys_accept(fd) {
                Ok((child, peer)) => {
                    trace!(handle = self.inner.id, %peer, "accepted connection");
                    child
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(handle = self.inner.id, error = %e, "accepting a new socket failed");
                    return Ok(());
                }
            };

            let socket = SocketHandle::accepted(lp, child);
            let Some(mut on_connection) = self.inner.on_connection.borrow_mut().take() else {
                socket.close(lp);
                return Ok(());
            };

            let outcome = on_connection(lp, socket);

            if self.inner.phase.get() == Phase::Listening {
                let mut slot = self.inner.on_connection.borrow_mut();
                if slot.is_none() {
                    *slot = Some(on_connection);
                }
            }

            outcome?;
        }
    }

    fn process_read(&self, lp: &mut EventLoop) -> ScriptResult {
        let inner = &self.inner;
        let Some(fd) = inner.fd.get() else {
            return Ok(());
        };
        if !inner.reading.get() {
            return Ok(());
        }

        let read = {
            let mut buffer = inner.read_buffer.borrow_mut();
            if buffer.len() != READ_BUFFER {
                buffer.resize(READ_BUFFER, 0);
            }

            match sys_read(fd, &mut buffer) {
                Ok(0) => Err(None),
                Ok(n) => Ok(buffer[..n].to_vec()),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                    return Ok(());
                }
                Err(e) => Err(Some(e)),
            }
        };

        match read {
            Ok(data) => {
                trace!(handle = inner.id, bytes = data.len(), "read");
                inner.on_read.dispatch(lp, ReadEvent::Data(data))
            }
            Err(cause) => {
                if let Some(e) = &cause {
                    debug!(handle = inner.id, error = %e, "reading from socket failed");
                }

                inner.eof.set(true);
                inner.reading.set(false);
                self.release(lp);
                if let Err(e) = self.update_interest(lp) {
                    debug!(handle = inner.id, error = %e, "updating interest failed");
                }

                inner.on_read.dispatch(lp, ReadEvent::Eof)
            }
        }
    }

    /// Writes as much of the queue as the socket accepts.
    fn flush_writes(&self, lp: &mut EventLoop) {
        let inner = &self.inner;
        let Some(fd) = inner.fd.get() else {
            return;
        };

        inner.write_blocked.set(false);

        loop {
            let mut writes = inner.writes.borrow_mut();
            let Some(head) = writes.front_mut() else {
                break;
            };

            let result = match &head.data {
                None => {
                    trace!(handle = inner.id, "sending shutdown");
                    sys_shutdown(fd, Shutdown::Write).map_err(|e| write_error(&e))
                }
                Some(data) => match sys_send(fd, &data[head.offset..]) {
                    Ok(n) => {
                        head.offset += n;
                        if head.offset < data.len() {
                            inner.write_blocked.set(true);
                            break;
                        }
                        Ok(())
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        inner.write_blocked.set(true);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(handle = inner.id, error = %e, "write failed");
                        Err(write_error(&e))
                    }
                },
            };

            let Some(done) = writes.pop_front() else {
                break;
            };
            drop(writes);

            self.complete_write(lp, done, result);
        }

        if let Err(e) = self.update_interest(lp) {
            debug!(handle = inner.id, error = %e, "updating interest failed");
        }
    }

    /// Queues the completion behind every earlier one.
    fn complete_write(&self, lp: &mut EventLoop, write: QueuedWrite, result: Result<(), OsError>) {
        self.release(lp);
        let on_complete = write.on_complete;
        lp.defer(move |lp| on_complete(lp, result));
    }

    fn fail_writes(&self, lp: &mut EventLoop, errno: Errno) {
        let pending: Vec<_> = self.inner.writes.borrow_mut().drain(..).collect();
        self.inner.write_blocked.set(false);

        for write in pending {
            self.complete_write(lp, write, Err(OsError::new(errno, "write")));
        }
    }

    fn enqueue(&self, lp: &mut EventLoop, data: Option<Vec<u8>>, on_complete: WriteCallback) -> Result<(), OsError> {
        let inner = &self.inner;
        let syscall = if data.is_some() { "write" } else { "shutdown" };

        match inner.phase.get() {
            Phase::Connected | Phase::Connecting => {}
            Phase::Closed => return Err(OsError::new(Errno::BadDescriptor, syscall)),
            _ => return Err(not_capable(syscall)),
        }

        let was_idle = inner.writes.borrow().is_empty();
        inner.writes.borrow_mut().push_back(QueuedWrite {
            data,
            offset: 0,
            on_complete,
        });
        self.hold(lp);

        if was_idle && inner.phase.get() == Phase::Connected {
            self.flush_writes(lp);
        }

        Ok(())
    }

    /// Drops the reactor registration and the descriptor.
    fn detach(&self, lp: &mut EventLoop) {
        let inner = &self.inner;
        let Some(fd) = inner.fd.take() else {
            return;
        };

        if let Some(token) = inner.token.take() {
            lp.reactor_mut().deregister(fd, token);
        }

        inner.interest.set(Interest::NONE);
        sys_close(fd);
    }
}

fn setup_listener(fd: RawFd, addr: &SocketAddr, backlog: i32) -> io::Result<()> {
    sys_set_nonblocking(fd)?;
    sys_set_reuseaddr(fd)?;
    sys_ipv6_is_necessary(fd, addr)?;
    sys_bind(fd, addr)?;
    sys_listen(fd, backlog.max(1))
}

fn start_connect(fd: RawFd, local: Option<SocketAddr>, target: &SocketAddr) -> io::Result<()> {
    sys_set_nonblocking(fd)?;
    if let Some(local) = local {
        sys_bind(fd, &local)?;
    }
    sys_connect(fd, target)
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

fn write_error(err: &io::Error) -> OsError {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::NotConnected => OsError::new(Errno::Eof, "write"),
        _ => OsError::new(Errno::Io, "write"),
    }
}

impl Selectable for SocketHandle {
    fn selected(&self, lp: &mut EventLoop, event: Event) -> ScriptResult {
        match self.inner.phase.get() {
            Phase::Listening if event.readable => self.process_accept(lp),
            Phase::Connecting if event.writable || event.readable => self.process_connect(lp),
            Phase::Connected => {
                if event.writable && !self.inner.writes.borrow().is_empty() {
                    self.flush_writes(lp);
                }
                if event.readable {
                    self.process_read(lp)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Handle for SocketHandle {
    fn id(&self) -> HandleId {
        self.inner.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Tcp
    }

    fn write(&self, lp: &mut EventLoop, data: Vec<u8>, on_complete: WriteCallback) -> Result<(), OsError> {
        self.enqueue(lp, Some(data), on_complete)
    }

    fn shutdown(&self, lp: &mut EventLoop, on_complete: WriteCallback) -> Result<(), OsError> {
        self.enqueue(lp, None, on_complete)
    }

    fn start_reading(&self, lp: &mut EventLoop, on_read: ReadCallback) -> Result<(), OsError> {
        let inner = &self.inner;

        match inner.phase.get() {
            Phase::Connected | Phase::Connecting => {}
            Phase::Closed => return Err(OsError::new(Errno::BadDescriptor, "read")),
            _ => return Err(not_capable("read")),
        }

        inner.on_read.set(on_read);

        if inner.reading.get() || inner.eof.get() {
            return Ok(());
        }

        inner.reading.set(true);
        self.hold(lp);

        self.update_interest(lp)
            .map_err(|e| OsError::from_io("read", &e))
    }

    fn stop_reading(&self, lp: &mut EventLoop) {
        if self.inner.reading.replace(false) {
            self.release(lp);
            if let Err(e) = self.update_interest(lp) {
                debug!(handle = self.inner.id, error = %e, "updating interest failed");
            }
        }
    }

    fn writes_outstanding(&self) -> usize {
        self.inner.writes.borrow().len()
    }

    fn is_closed(&self) -> bool {
        self.inner.phase.get() == Phase::Closed
    }

    fn close(&self, lp: &mut EventLoop) {
        let inner = &self.inner;
        if inner.phase.replace(Phase::Closed) == Phase::Closed {
            return;
        }

        trace!(handle = inner.id, "closing socket");

        self.detach(lp);
        self.fail_writes(lp, Errno::Eof);

        if let Some(on_connect) = inner.on_connect.borrow_mut().take() {
            let failure = Err(OsError::new(Errno::Eof, "connect"));
            lp.defer(move |lp| on_connect(lp, failure));
        }

        inner.reading.set(false);
        inner.on_read.clear();
        inner.on_connection.borrow_mut().take();

        while inner.pins.get() > 0 {
            self.release(lp);
        }

        lp.unregister_handle(inner.id);
    }
}
