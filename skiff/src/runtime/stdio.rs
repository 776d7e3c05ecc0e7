use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// A shareable byte source for a session's stdin.
///
/// Clones read from the same underlying stream; a nested session inheriting
/// its parent's stdin holds such a clone.
#[derive(Clone)]
pub struct InputStream(Arc<Mutex<Box<dyn Read + Send>>>);

impl InputStream {
    pub fn new<R>(source: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Box::new(source))))
    }

    /// Immediately at end of stream.
    pub fn empty() -> Self {
        Self::new(io::empty())
    }

    /// The host process's stdin.
    pub fn stdin() -> Self {
        Self::new(io::stdin())
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().read(buf)
    }
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InputStream")
    }
}

/// A shareable byte sink for a session's stdout or stderr.
#[derive(Clone)]
pub struct OutputStream(Arc<Mutex<Box<dyn Write + Send>>>);

impl OutputStream {
    pub fn new<W>(sink: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Box::new(sink))))
    }

    /// Discards everything.
    pub fn sink() -> Self {
        Self::new(io::sink())
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flush()
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputStream")
    }
}

/// An in-memory sink whose contents can be read back.
///
/// ```rust,ignore
/// let captured = SharedBuffer::default();
/// let sandbox = Sandbox::new().with_stdout(OutputStream::new(captured.clone()));
/// // ... run a session ...
/// assert_eq!(captured.contents(), b"hello\n");
/// ```
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_underlying_stream() {
        let buffer = SharedBuffer::default();
        let mut a = OutputStream::new(buffer.clone());
        let mut b = a.clone();

        a.write_all(b"one ").unwrap();
        b.write_all(b"two").unwrap();

        assert_eq!(buffer.to_string_lossy(), "one two");
    }

    #[test]
    fn input_clones_consume_the_same_bytes() {
        let mut a = InputStream::new(io::Cursor::new(b"abcdef".to_vec()));
        let mut b = a.clone();

        let mut first = [0u8; 3];
        a.read_exact(&mut first).unwrap();
        let mut rest = String::new();
        b.read_to_string(&mut rest).unwrap();

        assert_eq!(&first, b"abc");
        assert_eq!(rest, "def");
    }
}
