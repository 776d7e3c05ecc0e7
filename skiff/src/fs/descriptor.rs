use crate::error::{Errno, OsError};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// First descriptor handed out; 0 to 3 are reserved for the console and ipc.
const FIRST_FD: i32 = 4;

/// One open descriptor.
///
/// Directories (and anything else opened without a file channel) carry
/// no `file`; they support only path-based operations.
pub(crate) struct FileEntry {
    /// Script-visible path, for error messages.
    pub(crate) path: String,
    /// Host path.
    pub(crate) host: PathBuf,
    pub(crate) file: Option<File>,
    /// Cursor for implicit-offset reads and writes.
    pub(crate) position: AtomicU64,
}

impl FileEntry {
    pub(crate) fn file(&self, syscall: &'static str) -> Result<&File, OsError> {
        self.file
            .as_ref()
            .ok_or_else(|| OsError::new(Errno::IsDirectory, syscall))
    }

    pub(crate) fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self, count: u64) {
        self.position.fetch_add(count, Ordering::AcqRel);
    }
}

/// Integer descriptors of a session.
///
/// Allocation is monotonic; a number is never handed out twice. Operations
/// hold their own reference to the entry, so closing a descriptor while an
/// operation is in flight does not pull the file out from under it.
pub(crate) struct DescriptorTable {
    next: AtomicI32,
    entries: Mutex<HashMap<i32, Arc<FileEntry>>>,
}

impl DescriptorTable {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicI32::new(FIRST_FD),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, entry: FileEntry) -> i32 {
        let fd = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(fd, Arc::new(entry));
        fd
    }

    pub(crate) fn get(&self, fd: i32, syscall: &'static str) -> Result<Arc<FileEntry>, OsError> {
        self.entries
            .lock()
            .get(&fd)
            .cloned()
            .ok_or_else(|| OsError::new(Errno::BadDescriptor, syscall))
    }

    pub(crate) fn remove(&self, fd: i32) -> Result<Arc<FileEntry>, OsError> {
        self.entries
            .lock()
            .remove(&fd)
            .ok_or_else(|| OsError::new(Errno::BadDescriptor, "close"))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            host: PathBuf::from(path),
            file: None,
            position: AtomicU64::new(0),
        }
    }

    #[test]
    fn descriptors_are_never_reused() {
        let table = DescriptorTable::new();

        let a = table.insert(entry("/a"));
        let b = table.insert(entry("/b"));
        assert_eq!((a, b), (4, 5));

        table.remove(a).unwrap();
        let c = table.insert(entry("/c"));
        assert_eq!(c, 6);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn unknown_descriptor_is_ebadf() {
        let table = DescriptorTable::new();

        let err = table.get(42, "read").err().unwrap();
        assert_eq!(err.errno(), Errno::BadDescriptor);
        assert_eq!(table.remove(42).err().unwrap().errno(), Errno::BadDescriptor);
    }

    #[test]
    fn path_only_entries_reject_file_io() {
        let table = DescriptorTable::new();
        let fd = table.insert(entry("/dir"));

        let entry = table.get(fd, "read").unwrap();
        assert_eq!(entry.file("read").err().unwrap().errno(), Errno::IsDirectory);
    }
}
