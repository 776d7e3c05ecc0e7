//! The asynchronous filesystem dispatcher.
//!
//! [`FsCore`] holds a session's descriptor table, path translator and
//! umask, and implements every operation as a plain blocking call. The
//! [`Filesystem`] facade exposes each operation twice: a `*_sync` form that
//! blocks the loop thread, and an asynchronous form that runs on the async
//! pool and delivers its result back on the loop.
//!
//! Implicit-offset reads and writes on one descriptor are serialized in
//! submission order, so sequential submissions observe sequential,
//! non-overlapping ranges.

pub mod constants;

mod descriptor;
mod ops;
mod path;
mod stat;

pub use ops::FsCore;
pub use path::PathTranslator;
pub use stat::Stats;

use crate::error::{OsError, ScriptResult};
use crate::handle::{HandleKind, StreamHandle};
use crate::scheduler::EventLoop;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

type Chained = Box<dyn FnOnce(&mut EventLoop)>;

/// Queue of implicit-offset operations waiting on one descriptor.
#[derive(Default)]
pub(crate) struct CursorChain {
    busy: bool,
    waiting: VecDeque<Chained>,
}

/// Filesystem operations of a session, borrowed from its loop.
///
/// ```rust,ignore
/// let fd = lp.fs().open_sync("/etc/hostname", O_RDONLY, 0)?;
/// lp.fs().read(fd, 64, None, move |lp, result| {
///     let bytes = result?;
///     lp.fs().close_sync(fd)?;
///     Ok(())
/// });
/// ```
pub struct Filesystem<'a> {
    lp: &'a mut EventLoop,
}

impl<'a> Filesystem<'a> {
    pub(crate) fn new(lp: &'a mut EventLoop) -> Self {
        Self { lp }
    }

    fn core(&self) -> Arc<FsCore> {
        self.lp.fs_core().clone()
    }

    /// Runs `op` on the async pool and hands its result to `handler`.
    fn dispatch<T, Op, H>(self, syscall: &'static str, op: Op, handler: H)
    where
        T: Send + 'static,
        Op: FnOnce(&FsCore) -> Result<T, OsError> + Send + 'static,
        H: FnOnce(&mut EventLoop, Result<T, OsError>) -> ScriptResult + 'static,
    {
        let core = self.core();
        self.lp.run_async(syscall, move || op(&core), handler);
    }

    /// Like [`Filesystem::dispatch`], but queued behind any implicit-offset
    /// operation already in flight on `fd`.
    fn dispatch_chained<T, Op, H>(self, fd: i32, syscall: &'static str, op: Op, handler: H)
    where
        T: Send + 'static,
        Op: FnOnce(&FsCore) -> Result<T, OsError> + Send + 'static,
        H: FnOnce(&mut EventLoop, Result<T, OsError>) -> ScriptResult + 'static,
    {
        let core = self.core();
        let run: Chained = Box::new(move |lp: &mut EventLoop| {
            lp.run_async(syscall, move || op(&core), move |lp, result| {
                release_cursor(lp, fd);
                handler(lp, result)
            });
        });

        let chain = self.lp.cursor_chains().entry(fd).or_default();
        if chain.busy {
            chain.waiting.push_back(run);
        } else {
            chain.busy = true;
            run(self.lp);
        }
    }

    pub fn open_sync(&self, path: &str, flags: u32, mode: u32) -> Result<i32, OsError> {
        self.lp.fs_core().open(path, flags, mode)
    }

    pub fn open<H>(self, path: &str, flags: u32, mode: u32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<i32, OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("open", move |fs| fs.open(&path, flags, mode), handler);
    }

    pub fn close_sync(&self, fd: i32) -> Result<(), OsError> {
        self.lp.fs_core().close(fd)
    }

    pub fn close<H>(self, fd: i32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        self.dispatch("close", move |fs| fs.close(fd), handler);
    }

    /// Reads up to `length` bytes. `None` reads at, and advances, the
    /// descriptor's cursor.
    pub fn read_sync(&self, fd: i32, length: usize, position: Option<u64>) -> Result<Vec<u8>, OsError> {
        self.lp.fs_core().read(fd, length, position)
    }

    pub fn read<H>(self, fd: i32, length: usize, position: Option<u64>, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<Vec<u8>, OsError>) -> ScriptResult + 'static,
    {
        let op = move |fs: &FsCore| fs.read(fd, length, position);

        match position {
            Some(_) => self.dispatch("read", op, handler),
            None => self.dispatch_chained(fd, "read", op, handler),
        }
    }

    pub fn write_sync(&self, fd: i32, data: &[u8], position: Option<u64>) -> Result<usize, OsError> {
        self.lp.fs_core().write(fd, data, position)
    }

    pub fn write<H>(self, fd: i32, data: Vec<u8>, position: Option<u64>, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<usize, OsError>) -> ScriptResult + 'static,
    {
        let op = move |fs: &FsCore| fs.write(fd, &data, position);

        match position {
            Some(_) => self.dispatch("write", op, handler),
            None => self.dispatch_chained(fd, "write", op, handler),
        }
    }

    pub fn stat_sync(&self, path: &str) -> Result<Stats, OsError> {
        self.lp.fs_core().stat(path)
    }

    pub fn stat<H>(self, path: &str, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<Stats, OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("stat", move |fs| fs.stat(&path), handler);
    }

    pub fn lstat_sync(&self, path: &str) -> Result<Stats, OsError> {
        self.lp.fs_core().lstat(path)
    }

    pub fn lstat<H>(self, path: &str, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<Stats, OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("lstat", move |fs| fs.lstat(&path), handler);
    }

    pub fn fstat_sync(&self, fd: i32) -> Result<Stats, OsError> {
        self.lp.fs_core().fstat(fd)
    }

    pub fn fstat<H>(self, fd: i32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<Stats, OsError>) -> ScriptResult + 'static,
    {
        self.dispatch("fstat", move |fs| fs.fstat(fd), handler);
    }

    pub fn rename_sync(&self, from: &str, to: &str) -> Result<(), OsError> {
        self.lp.fs_core().rename(from, to)
    }

    pub fn rename<H>(self, from: &str, to: &str, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let (from, to) = (from.to_string(), to.to_string());
        self.dispatch("rename", move |fs| fs.rename(&from, &to), handler);
    }

    pub fn ftruncate_sync(&self, fd: i32, length: u64) -> Result<(), OsError> {
        self.lp.fs_core().ftruncate(fd, length)
    }

    pub fn ftruncate<H>(self, fd: i32, length: u64, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        self.dispatch("ftruncate", move |fs| fs.ftruncate(fd, length), handler);
    }

    pub fn rmdir_sync(&self, path: &str) -> Result<(), OsError> {
        self.lp.fs_core().rmdir(path)
    }

    pub fn rmdir<H>(self, path: &str, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("rmdir", move |fs| fs.rmdir(&path), handler);
    }

    pub fn mkdir_sync(&self, path: &str, mode: u32) -> Result<(), OsError> {
        self.lp.fs_core().mkdir(path, mode)
    }

    pub fn mkdir<H>(self, path: &str, mode: u32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("mkdir", move |fs| fs.mkdir(&path, mode), handler);
    }

    pub fn readdir_sync(&self, path: &str) -> Result<Vec<String>, OsError> {
        self.lp.fs_core().readdir(path)
    }

    pub fn readdir<H>(self, path: &str, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<Vec<String>, OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("readdir", move |fs| fs.readdir(&path), handler);
    }

    pub fn readlink_sync(&self, path: &str) -> Result<String, OsError> {
        self.lp.fs_core().readlink(path)
    }

    pub fn readlink<H>(self, path: &str, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<String, OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("readlink", move |fs| fs.readlink(&path), handler);
    }

    pub fn symlink_sync(&self, target: &str, path: &str) -> Result<(), OsError> {
        self.lp.fs_core().symlink(target, path)
    }

    pub fn symlink<H>(self, target: &str, path: &str, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let (target, path) = (target.to_string(), path.to_string());
        self.dispatch("symlink", move |fs| fs.symlink(&target, &path), handler);
    }

    pub fn link_sync(&self, existing: &str, path: &str) -> Result<(), OsError> {
        self.lp.fs_core().link(existing, path)
    }

    pub fn link<H>(self, existing: &str, path: &str, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let (existing, path) = (existing.to_string(), path.to_string());
        self.dispatch("link", move |fs| fs.link(&existing, &path), handler);
    }

    pub fn unlink_sync(&self, path: &str) -> Result<(), OsError> {
        self.lp.fs_core().unlink(path)
    }

    pub fn unlink<H>(self, path: &str, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("unlink", move |fs| fs.unlink(&path), handler);
    }

    pub fn chmod_sync(&self, path: &str, mode: u32) -> Result<(), OsError> {
        self.lp.fs_core().chmod(path, mode)
    }

    pub fn chmod<H>(self, path: &str, mode: u32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("chmod", move |fs| fs.chmod(&path, mode), handler);
    }

    pub fn fchmod_sync(&self, fd: i32, mode: u32) -> Result<(), OsError> {
        self.lp.fs_core().fchmod(fd, mode)
    }

    pub fn fchmod<H>(self, fd: i32, mode: u32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        self.dispatch("fchmod", move |fs| fs.fchmod(fd, mode), handler);
    }

    pub fn chown_sync(&self, path: &str, uid: u32, gid: u32) -> Result<(), OsError> {
        self.lp.fs_core().chown(path, uid, gid)
    }

    pub fn chown<H>(self, path: &str, uid: u32, gid: u32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("chown", move |fs| fs.chown(&path, uid, gid), handler);
    }

    pub fn fchown_sync(&self, fd: i32, uid: u32, gid: u32) -> Result<(), OsError> {
        self.lp.fs_core().fchown(fd, uid, gid)
    }

    pub fn fchown<H>(self, fd: i32, uid: u32, gid: u32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        self.dispatch("fchown", move |fs| fs.fchown(fd, uid, gid), handler);
    }

    pub fn utimes_sync(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<(), OsError> {
        self.lp.fs_core().utimes(path, atime, mtime)
    }

    pub fn utimes<H>(self, path: &str, atime: SystemTime, mtime: SystemTime, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        let path = path.to_string();
        self.dispatch("utime", move |fs| fs.utimes(&path, atime, mtime), handler);
    }

    pub fn futimes_sync(&self, fd: i32, atime: SystemTime, mtime: SystemTime) -> Result<(), OsError> {
        self.lp.fs_core().futimes(fd, atime, mtime)
    }

    pub fn futimes<H>(self, fd: i32, atime: SystemTime, mtime: SystemTime, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        self.dispatch("futime", move |fs| fs.futimes(fd, atime, mtime), handler);
    }

    pub fn fsync_sync(&self, fd: i32) -> Result<(), OsError> {
        self.lp.fs_core().fsync(fd)
    }

    pub fn fsync<H>(self, fd: i32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        self.dispatch("fsync", move |fs| fs.fsync(fd), handler);
    }

    pub fn fdatasync_sync(&self, fd: i32) -> Result<(), OsError> {
        self.lp.fs_core().fdatasync(fd)
    }

    pub fn fdatasync<H>(self, fd: i32, handler: H)
    where
        H: FnOnce(&mut EventLoop, Result<(), OsError>) -> ScriptResult + 'static,
    {
        self.dispatch("fdatasync", move |fs| fs.fdatasync(fd), handler);
    }

    /// A readable [`StreamHandle`] over the file at `path`.
    pub fn create_read_stream(self, path: &str) -> Result<StreamHandle, OsError> {
        let file = self.lp.fs_core().open_file(path, constants::O_RDONLY, 0)?;
        Ok(StreamHandle::reader(self.lp, HandleKind::File, file))
    }

    /// A writable [`StreamHandle`] over the file at `path`, created if
    /// missing. `append` keeps existing content; otherwise it is truncated.
    pub fn create_write_stream(self, path: &str, append: bool) -> Result<StreamHandle, OsError> {
        use constants::{O_APPEND, O_CREAT, O_TRUNC, O_WRONLY};

        let flags = O_WRONLY | O_CREAT | (if append { O_APPEND } else { O_TRUNC });
        let file = self.lp.fs_core().open_file(path, flags, 0o666)?;
        let file = if append { into_append(file, path)? } else { file };

        Ok(StreamHandle::writer(self.lp, HandleKind::File, file))
    }
}

/// Seeks a freshly opened file to its end so sequential writes append.
fn into_append(mut file: std::fs::File, path: &str) -> Result<std::fs::File, OsError> {
    use std::io::{Seek, SeekFrom};

    file.seek(SeekFrom::End(0))
        .map_err(|e| OsError::from_io("open", &e).with_path(path))?;
    Ok(file)
}

/// Hands the descriptor's cursor to the next queued operation, if any.
fn release_cursor(lp: &mut EventLoop, fd: i32) {
    let chains = lp.cursor_chains();

    let next = match chains.get_mut(&fd) {
        Some(chain) => match chain.waiting.pop_front() {
            Some(next) => next,
            None => {
                chains.remove(&fd);
                return;
            }
        },
        None => return,
    };

    next(lp);
}
