use crate::runtime::ScriptFuture;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide bookkeeping of nested sessions.
///
/// Hands out their pids and tracks the ones still running. This and the
/// allocator in it are the only state shared across sessions.
pub struct ProcessTable {
    next: AtomicU32,
    running: Mutex<HashMap<u32, ScriptFuture>>,
}

impl ProcessTable {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static ProcessTable {
        static TABLE: OnceLock<ProcessTable> = OnceLock::new();
        TABLE.get_or_init(ProcessTable::new)
    }

    pub(crate) fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, pid: u32, future: ScriptFuture) {
        self.running.lock().insert(pid, future);
    }

    pub(crate) fn remove(&self, pid: u32) -> Option<ScriptFuture> {
        self.running.lock().remove(&pid)
    }

    /// The future of the nested session `pid`, if it is still running.
    pub fn get(&self, pid: u32) -> Option<ScriptFuture> {
        self.running.lock().get(&pid).cloned()
    }

    /// Nested sessions still running.
    pub fn len(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_unique() {
        let table = ProcessTable::new();
        let a = table.allocate();
        let b = table.allocate();

        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn tracks_running_sessions() {
        let table = ProcessTable::new();
        let pid = table.allocate();

        table.insert(pid, ScriptFuture::new());
        assert!(table.get(pid).is_some());
        assert_eq!(table.len(), 1);

        table.remove(pid);
        assert!(table.is_empty());
    }
}
