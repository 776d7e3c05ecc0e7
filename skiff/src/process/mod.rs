//! Child processes.
//!
//! [`EventLoop::spawn`] starts either an OS process or, when the program
//! is the runtime's own executable name, a nested session on the same
//! environment. Both flavors look alike to the parent: a [`ChildProcess`]
//! with optional stdio stream handles and an exit callback that fires
//! exactly once on the parent's loop.
//!
//! The parent loop stays pinned from spawn until the exit is delivered.

mod info;
mod nested;
mod os;
mod piper;
mod table;

pub use info::{ProcessInfo, StdioKind};
pub use table::ProcessTable;

use crate::error::{Errno, OsError, ScriptResult};
use crate::handle::StreamHandle;
use crate::reactor::platform;
use crate::runtime::ScriptFuture;
use crate::scheduler::{EventLoop, Payload, PortId};

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `128 + signal` if a signal ended it.
    pub code: i32,
    pub signal: Option<i32>,
}

pub(crate) type ExitCallback = Box<dyn FnOnce(&mut EventLoop, ProcessExit) -> ScriptResult>;

enum Control {
    /// Set, under the lock, before the pid is reaped.
    Os { reaped: Arc<Mutex<bool>> },
    Nested { future: ScriptFuture },
}

/// A running child as seen by its parent.
pub struct ChildProcess {
    pid: u32,
    stdin: Option<StreamHandle>,
    stdout: Option<StreamHandle>,
    stderr: Option<StreamHandle>,
    control: Control,
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Writable end of the child's stdin, if it is a pipe.
    pub fn stdin(&self) -> Option<&StreamHandle> {
        self.stdin.as_ref()
    }

    /// Readable end of the child's stdout, if it is a pipe.
    pub fn stdout(&self) -> Option<&StreamHandle> {
        self.stdout.as_ref()
    }

    pub fn stderr(&self) -> Option<&StreamHandle> {
        self.stderr.as_ref()
    }

    /// Whether the child is a nested session rather than an OS process.
    pub fn is_nested(&self) -> bool {
        matches!(self.control, Control::Nested { .. })
    }

    /// Sends the signal named `signal`, e.g. `"SIGTERM"`.
    ///
    /// A nested session is cancelled whatever the signal.
    ///
    /// # Errors
    ///
    /// `EINVAL` for an unsupported signal name, `ESRCH` if the child has
    /// already exited.
    pub fn kill(&self, signal: &str) -> Result<(), OsError> {
        let number = signal_number(signal).ok_or_else(|| OsError::new(Errno::InvalidArgument, "kill"))?;

        match &self.control {
            Control::Os { reaped } => {
                let reaped = reaped.lock();
                if *reaped {
                    return Err(OsError::new(Errno::NoSuchProcess, "kill"));
                }
                platform::sys_kill(self.pid, number).map_err(|e| OsError::from_io("kill", &e))
            }
            Control::Nested { future } => {
                if future.cancel() {
                    Ok(())
                } else {
                    Err(OsError::new(Errno::NoSuchProcess, "kill"))
                }
            }
        }
    }
}

fn signal_number(name: &str) -> Option<libc::c_int> {
    match name {
        "SIGHUP" => Some(libc::SIGHUP),
        "SIGINT" => Some(libc::SIGINT),
        "SIGKILL" => Some(libc::SIGKILL),
        "SIGQUIT" => Some(libc::SIGQUIT),
        "SIGTERM" => Some(libc::SIGTERM),
        _ => None,
    }
}

pub(crate) fn spawn(lp: &mut EventLoop, info: ProcessInfo, on_exit: ExitCallback) -> Result<ChildProcess, OsError> {
    let Some(program) = info.args.first() else {
        return Err(OsError::new(Errno::InvalidArgument, "spawn"));
    };

    let name = lp.environment().executable_name();
    let nested = program == name || program.strip_prefix("./") == Some(name);

    debug!(program = %program, nested, "spawning child");

    if nested {
        nested::spawn(lp, info, on_exit)
    } else {
        os::spawn(lp, info, on_exit)
    }
}

/// The child's script-visible and host working directory.
fn working_directory(lp: &EventLoop, cwd: Option<&str>) -> Result<(String, PathBuf), OsError> {
    let fs = lp.fs_core();

    let path = match cwd {
        Some(cwd) => fs.resolve(cwd, "spawn")?,
        None => fs.working_directory(),
    };
    let host = fs.translate(&path, "spawn")?;

    match std::fs::metadata(&host) {
        Ok(meta) if meta.is_dir() => Ok((path, host)),
        Ok(_) => Err(OsError::new(Errno::NotDirectory, "spawn").with_path(path)),
        Err(_) => Err(OsError::new(Errno::NotFound, "spawn").with_path(path)),
    }
}

/// Opens the port the child's exit is posted to and pins the loop until
/// it arrives.
fn exit_port(lp: &mut EventLoop, on_exit: ExitCallback) -> PortId {
    lp.pin();

    lp.open_port(move |lp, payload: Payload| {
        lp.unpin();

        let exit = match payload.downcast::<ProcessExit>() {
            Ok(exit) => *exit,
            Err(_) => ProcessExit { code: -1, signal: None },
        };

        debug!(code = exit.code, signal = ?exit.signal, "child exited");
        on_exit(lp, exit)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_signals() {
        assert_eq!(signal_number("SIGTERM"), Some(libc::SIGTERM));
        assert_eq!(signal_number("SIGKILL"), Some(libc::SIGKILL));
        assert_eq!(signal_number("SIGUSR1"), None);
        assert_eq!(signal_number("TERM"), None);
    }
}
