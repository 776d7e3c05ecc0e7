use super::constants::{
    O_APPEND, O_CREAT, O_DIRECTORY, O_EXCL, O_NOFOLLOW, O_SYNC, O_TRUNC, wants_read, wants_write,
};
use super::descriptor::{DescriptorTable, FileEntry};
use super::path::PathTranslator;
use super::stat::Stats;
use crate::error::{Errno, OsError};

use parking_lot::RwLock;
use std::fs::{self, File, FileTimes, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, trace};

/// Blocking filesystem primitives of one session.
///
/// Shared between the loop thread and the async pool. Every operation
/// works on script-visible paths and descriptors, and reports failures as
/// [`OsError`]s carrying the script path.
pub struct FsCore {
    translator: RwLock<PathTranslator>,
    descriptors: DescriptorTable,
    umask: AtomicU32,
}

fn os_error<'a>(syscall: &'static str, path: &'a str) -> impl FnOnce(io::Error) -> OsError + 'a {
    move |e| {
        trace!(syscall, path, error = %e, "filesystem error");
        OsError::from_io(syscall, &e).with_path(path)
    }
}

impl FsCore {
    pub(crate) fn new(translator: PathTranslator, umask: u32) -> Self {
        Self {
            translator: RwLock::new(translator),
            descriptors: DescriptorTable::new(),
            umask: AtomicU32::new(umask),
        }
    }

    /// Host path for a script path; `ENOENT` if it escapes the sandbox.
    pub fn translate(&self, path: &str, syscall: &'static str) -> Result<PathBuf, OsError> {
        self.translator
            .read()
            .translate(path)
            .ok_or_else(|| OsError::new(Errno::NotFound, syscall).with_path(path))
    }

    /// Absolute, normalized script path for `path`.
    pub fn resolve(&self, path: &str, syscall: &'static str) -> Result<String, OsError> {
        self.translator
            .read()
            .normalize(path)
            .ok_or_else(|| OsError::new(Errno::NotFound, syscall).with_path(path))
    }

    pub fn working_directory(&self) -> String {
        self.translator.read().working_dir().to_string()
    }

    pub fn chdir(&self, path: &str) -> Result<(), OsError> {
        let mut translator = self.translator.write();

        let target = translator
            .normalize(path)
            .ok_or_else(|| OsError::new(Errno::NotFound, "chdir").with_path(path))?;
        let host = translator
            .translate(&target)
            .ok_or_else(|| OsError::new(Errno::NotFound, "chdir").with_path(path))?;

        let meta = fs::metadata(&host).map_err(os_error("chdir", path))?;
        if !meta.is_dir() {
            return Err(OsError::new(Errno::NotDirectory, "chdir").with_path(path));
        }

        debug!(from = translator.working_dir(), to = %target, "working directory changed");
        translator.set_working_dir(target);
        Ok(())
    }

    pub fn umask(&self) -> u32 {
        self.umask.load(Ordering::Acquire)
    }

    /// Replaces the umask, returning the previous one.
    pub fn set_umask(&self, mask: u32) -> u32 {
        self.umask.swap(mask & 0o777, Ordering::AcqRel)
    }

    /// Number of descriptors currently open.
    pub fn open_descriptors(&self) -> usize {
        self.descriptors.len()
    }

    /// Opens a host file with script flags, without allocating a descriptor.
    pub(crate) fn open_file(&self, path: &str, flags: u32, mode: u32) -> Result<File, OsError> {
        let host = self.translate(path, "open")?;
        self.open_host(&host, path, flags, mode)
    }

    fn open_host(&self, host: &Path, path: &str, flags: u32, mode: u32) -> Result<File, OsError> {
        let mut options = OpenOptions::new();
        options
            .read(wants_read(flags))
            .write(wants_write(flags))
            .truncate(flags & O_TRUNC != 0)
            .mode(mode & !self.umask());

        if flags & O_CREAT != 0 {
            if flags & O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }

        let mut custom = 0;
        if flags & O_SYNC != 0 {
            custom |= libc::O_SYNC;
        }
        if flags & O_NOFOLLOW != 0 {
            custom |= libc::O_NOFOLLOW;
        }
        options.custom_flags(custom);

        options.open(host).map_err(os_error("open", path))
    }

    pub fn open(&self, path: &str, flags: u32, mode: u32) -> Result<i32, OsError> {
        debug!(path, flags, mode, "open");

        let host = self.translate(path, "open")?;
        let is_dir = fs::metadata(&host).map(|m| m.is_dir()).unwrap_or(false);

        if flags & O_DIRECTORY != 0 && !is_dir {
            return Err(OsError::new(Errno::NotDirectory, "open").with_path(path));
        }

        let file = if is_dir {
            // Directories are recorded by path only.
            if wants_write(flags) {
                return Err(OsError::new(Errno::IsDirectory, "open").with_path(path));
            }
            None
        } else {
            Some(self.open_host(&host, path, flags, mode)?)
        };

        let position = match (&file, flags & O_APPEND != 0) {
            (Some(file), true) => file.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        };

        let fd = self.descriptors.insert(FileEntry {
            path: path.to_string(),
            host,
            file,
            position: AtomicU64::new(position),
        });

        trace!(fd, path, position, "descriptor opened");
        Ok(fd)
    }

    pub fn close(&self, fd: i32) -> Result<(), OsError> {
        let entry = self.descriptors.remove(fd)?;
        trace!(fd, path = %entry.path, "descriptor closed");
        Ok(())
    }

    /// Reads up to `length` bytes at `position`, or at the cursor if `None`.
    ///
    /// Only implicit-offset reads advance the cursor. End of file is an
    /// empty result.
    pub fn read(&self, fd: i32, length: usize, position: Option<u64>) -> Result<Vec<u8>, OsError> {
        let entry = self.descriptors.get(fd, "read")?;
        let file = entry.file("read")?;
        let offset = position.unwrap_or_else(|| entry.position());

        let mut buffer = vec![0u8; length];
        let count = loop {
            match file.read_at(&mut buffer, offset) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(os_error("read", &entry.path)(e)),
            }
        };
        buffer.truncate(count);

        if position.is_none() {
            entry.advance(count as u64);
        }

        trace!(fd, offset, requested = length, count, "read");
        Ok(buffer)
    }

    /// Writes all of `data` at `position`, or at the cursor if `None`.
    pub fn write(&self, fd: i32, data: &[u8], position: Option<u64>) -> Result<usize, OsError> {
        let entry = self.descriptors.get(fd, "write")?;
        let file = entry.file("write")?;
        let offset = position.unwrap_or_else(|| entry.position());

        file.write_all_at(data, offset)
            .map_err(os_error("write", &entry.path))?;

        if position.is_none() {
            entry.advance(data.len() as u64);
        }

        trace!(fd, offset, count = data.len(), "write");
        Ok(data.len())
    }

    pub fn stat(&self, path: &str) -> Result<Stats, OsError> {
        let host = self.translate(path, "stat")?;
        let meta = fs::metadata(&host).map_err(os_error("stat", path))?;
        Ok(Stats::from(&meta))
    }

    /// Like [`FsCore::stat`] without following a final symbolic link.
    pub fn lstat(&self, path: &str) -> Result<Stats, OsError> {
        let host = self.translate(path, "lstat")?;
        let meta = fs::symlink_metadata(&host).map_err(os_error("lstat", path))?;
        Ok(Stats::from(&meta))
    }

    pub fn fstat(&self, fd: i32) -> Result<Stats, OsError> {
        let entry = self.descriptors.get(fd, "fstat")?;
        let meta = match &entry.file {
            Some(file) => file.metadata(),
            None => fs::metadata(&entry.host),
        };

        meta.map(|m| Stats::from(&m))
            .map_err(os_error("fstat", &entry.path))
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), OsError> {
        let source = self.translate(from, "rename")?;
        let target = self.translate(to, "rename")?;

        fs::rename(&source, &target).map_err(os_error("rename", from))
    }

    pub fn ftruncate(&self, fd: i32, length: u64) -> Result<(), OsError> {
        let entry = self.descriptors.get(fd, "ftruncate")?;
        entry
            .file("ftruncate")?
            .set_len(length)
            .map_err(os_error("ftruncate", &entry.path))
    }

    pub fn rmdir(&self, path: &str) -> Result<(), OsError> {
        let host = self.translate(path, "rmdir")?;
        ensure_directory(&host, "rmdir", path)?;

        fs::remove_dir(&host).map_err(os_error("rmdir", path))
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<(), OsError> {
        let host = self.translate(path, "mkdir")?;

        fs::DirBuilder::new()
            .mode(mode & !self.umask())
            .create(&host)
            .map_err(os_error("mkdir", path))
    }

    /// Entry names of a directory, sorted.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, OsError> {
        let host = self.translate(path, "readdir")?;
        ensure_directory(&host, "readdir", path)?;

        let mut names = fs::read_dir(&host)
            .and_then(|entries| {
                entries
                    .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                    .collect::<io::Result<Vec<_>>>()
            })
            .map_err(os_error("readdir", path))?;

        names.sort();
        Ok(names)
    }

    /// Target of a symbolic link; `EINVAL` if `path` is not one.
    pub fn readlink(&self, path: &str) -> Result<String, OsError> {
        let host = self.translate(path, "readlink")?;
        let target = fs::read_link(&host).map_err(os_error("readlink", path))?;

        Ok(target.to_string_lossy().into_owned())
    }

    /// Creates `path` as a symbolic link to `target`.
    ///
    /// A relative target is stored verbatim; an absolute one is translated
    /// and must stay inside the sandbox.
    pub fn symlink(&self, target: &str, path: &str) -> Result<(), OsError> {
        let link = self.translate(path, "symlink")?;

        let target = if target.starts_with('/') {
            self.translate(target, "symlink")
                .map_err(|_| OsError::new(Errno::NotPermitted, "symlink").with_path(path))?
        } else {
            PathBuf::from(target)
        };

        std::os::unix::fs::symlink(&target, &link).map_err(os_error("symlink", path))
    }

    /// Creates `path` as a hard link to `existing`.
    pub fn link(&self, existing: &str, path: &str) -> Result<(), OsError> {
        let source = self.translate(existing, "link")?;
        let link = self.translate(path, "link")?;

        fs::hard_link(&source, &link).map_err(os_error("link", path))
    }

    /// Removes a file; a directory is `EPERM`.
    pub fn unlink(&self, path: &str) -> Result<(), OsError> {
        let host = self.translate(path, "unlink")?;

        if fs::symlink_metadata(&host).map(|m| m.is_dir()).unwrap_or(false) {
            return Err(OsError::new(Errno::NotPermitted, "unlink").with_path(path));
        }

        fs::remove_file(&host).map_err(os_error("unlink", path))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), OsError> {
        let host = self.translate(path, "chmod")?;
        fs::set_permissions(&host, Permissions::from_mode(mode)).map_err(os_error("chmod", path))
    }

    pub fn fchmod(&self, fd: i32, mode: u32) -> Result<(), OsError> {
        let entry = self.descriptors.get(fd, "fchmod")?;
        fs::set_permissions(&entry.host, Permissions::from_mode(mode))
            .map_err(os_error("fchmod", &entry.path))
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), OsError> {
        let host = self.translate(path, "chown")?;
        std::os::unix::fs::chown(&host, Some(uid), Some(gid)).map_err(os_error("chown", path))
    }

    pub fn fchown(&self, fd: i32, uid: u32, gid: u32) -> Result<(), OsError> {
        let entry = self.descriptors.get(fd, "fchown")?;
        let result = match &entry.file {
            Some(file) => std::os::unix::fs::fchown(file, Some(uid), Some(gid)),
            None => std::os::unix::fs::chown(&entry.host, Some(uid), Some(gid)),
        };

        result.map_err(os_error("fchown", &entry.path))
    }

    pub fn utimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<(), OsError> {
        let host = self.translate(path, "utime")?;
        set_times(&host, atime, mtime).map_err(os_error("utime", path))
    }

    pub fn futimes(&self, fd: i32, atime: SystemTime, mtime: SystemTime) -> Result<(), OsError> {
        let entry = self.descriptors.get(fd, "futime")?;
        let times = FileTimes::new().set_accessed(atime).set_modified(mtime);

        let result = match &entry.file {
            Some(file) => file.set_times(times),
            None => set_times(&entry.host, atime, mtime),
        };

        result.map_err(os_error("futime", &entry.path))
    }

    pub fn fsync(&self, fd: i32) -> Result<(), OsError> {
        let entry = self.descriptors.get(fd, "fsync")?;
        entry
            .file("fsync")?
            .sync_all()
            .map_err(os_error("fsync", &entry.path))
    }

    pub fn fdatasync(&self, fd: i32) -> Result<(), OsError> {
        let entry = self.descriptors.get(fd, "fdatasync")?;
        entry
            .file("fdatasync")?
            .sync_data()
            .map_err(os_error("fdatasync", &entry.path))
    }
}

fn ensure_directory(host: &Path, syscall: &'static str, path: &str) -> Result<(), OsError> {
    let meta = fs::metadata(host).map_err(os_error(syscall, path))?;
    if meta.is_dir() {
        Ok(())
    } else {
        Err(OsError::new(Errno::NotDirectory, syscall).with_path(path))
    }
}

fn set_times(host: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
    let file = File::open(host)?;
    file.set_times(FileTimes::new().set_accessed(atime).set_modified(mtime))
}

#[cfg(test)]
mod tests {
    use super::super::constants::{O_RDONLY, O_RDWR, O_WRONLY};
    use super::*;

    fn core(dir: &tempfile::TempDir) -> FsCore {
        let translator = PathTranslator::new("/").with_root(dir.path());
        FsCore::new(translator, 0o022)
    }

    #[test]
    fn implicit_offsets_advance_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let fs = core(&dir);

        let fd = fs.open("/data.bin", O_RDWR | O_CREAT, 0o644).unwrap();
        assert_eq!(fs.write(fd, b"hello world", None).unwrap(), 11);

        // Explicit offsets leave the cursor alone.
        assert_eq!(fs.read(fd, 5, Some(0)).unwrap(), b"hello");
        assert_eq!(fs.write(fd, b"!", None).unwrap(), 1);
        assert_eq!(fs.read(fd, 64, Some(0)).unwrap(), b"hello world!");

        fs.close(fd).unwrap();
        assert_eq!(fs.close(fd).unwrap_err().errno(), Errno::BadDescriptor);
    }

    #[test]
    fn append_starts_at_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("log.txt"), b"abc").unwrap();
        let fs = core(&dir);

        let fd = fs.open("/log.txt", O_WRONLY | O_APPEND, 0).unwrap();
        fs.write(fd, b"def", None).unwrap();
        fs.close(fd).unwrap();

        assert_eq!(std::fs::read(dir.path().join("log.txt")).unwrap(), b"abcdef");
    }

    #[test]
    fn directories_open_by_path_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let fs = core(&dir);

        let fd = fs.open("/sub", O_RDONLY, 0).unwrap();
        assert_eq!(fs.read(fd, 1, None).unwrap_err().errno(), Errno::IsDirectory);
        assert!(fs.fstat(fd).unwrap().is_directory());

        let err = fs.open("/sub", O_WRONLY, 0).unwrap_err();
        assert_eq!(err.errno(), Errno::IsDirectory);
    }

    #[test]
    fn error_mappings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("dir")).unwrap();
        let fs = core(&dir);

        assert_eq!(fs.rmdir("/file").unwrap_err().errno(), Errno::NotDirectory);
        assert_eq!(fs.readdir("/file").unwrap_err().errno(), Errno::NotDirectory);
        assert_eq!(fs.unlink("/dir").unwrap_err().errno(), Errno::NotPermitted);
        assert_eq!(fs.readlink("/file").unwrap_err().errno(), Errno::InvalidArgument);
        assert_eq!(fs.stat("/missing").unwrap_err().errno(), Errno::NotFound);
        assert_eq!(fs.stat("/../escape").unwrap_err().errno(), Errno::NotFound);

        let err = fs.open("/file", O_WRONLY | O_CREAT | O_EXCL, 0o644).unwrap_err();
        assert_eq!(err.errno(), Errno::Exists);
        assert_eq!(err.path(), Some("/file"));
    }

    #[test]
    fn mkdir_applies_umask_and_readdir_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let fs = core(&dir);

        fs.mkdir("/d", 0o777).unwrap();
        assert_eq!(fs.stat("/d").unwrap().permissions(), 0o755);

        for name in ["c", "a", "b"] {
            let fd = fs.open(&format!("/d/{name}"), O_WRONLY | O_CREAT, 0o666).unwrap();
            fs.close(fd).unwrap();
        }
        assert_eq!(fs.readdir("/d").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(fs.stat("/d/a").unwrap().permissions(), 0o644);
    }

    #[test]
    fn links_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("orig"), b"data").unwrap();
        let fs = core(&dir);

        fs.symlink("orig", "/soft").unwrap();
        assert_eq!(fs.readlink("/soft").unwrap(), "orig");
        assert!(fs.lstat("/soft").unwrap().is_symbolic_link());
        assert!(fs.stat("/soft").unwrap().is_file());

        fs.link("/orig", "/hard").unwrap();
        assert_eq!(fs.stat("/hard").unwrap().nlink, 2);

        fs.rename("/hard", "/moved").unwrap();
        assert_eq!(fs.stat("/moved").unwrap().size, 4);
        assert_eq!(fs.stat("/hard").unwrap_err().errno(), Errno::NotFound);
    }

    #[test]
    fn chdir_changes_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("work")).unwrap();
        std::fs::write(dir.path().join("work/f"), b"12345").unwrap();
        let fs = core(&dir);

        fs.chdir("work").unwrap();
        assert_eq!(fs.working_directory(), "/work");
        assert_eq!(fs.stat("f").unwrap().size, 5);
        assert_eq!(fs.chdir("f").unwrap_err().errno(), Errno::NotDirectory);
    }
}
