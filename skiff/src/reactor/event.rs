/// An I/O event reported by the poller.
///
/// Readiness is a hint: the source re-checks with a non-blocking syscall
/// and tolerates `EWOULDBLOCK`, so stale or spurious events are harmless.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Event {
    /// Token the source was registered under.
    pub(crate) token: usize,

    /// Readable, or the peer hung up, or an error is pending.
    pub(crate) readable: bool,

    /// Writable, or a pending connect has resolved.
    pub(crate) writable: bool,
}
