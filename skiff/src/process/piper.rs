use std::io::{self, Read, Write};

const CHUNK: usize = 8192;

/// Copies `from` into `to` until EOF or an error on either side.
///
/// Every chunk is flushed, so output interleaves with the destination's
/// other writers at chunk granularity.
pub(crate) fn relay<R, W>(mut from: R, mut to: W) -> io::Result<u64>
where
    R: Read,
    W: Write,
{
    let mut buffer = [0u8; CHUNK];
    let mut total = 0;

    loop {
        let n = match from.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        to.write_all(&buffer[..n])?;
        to.flush()?;
        total += n as u64;
    }
}
