use super::piper::relay;
use super::{ChildProcess, Control, ExitCallback, ProcessExit, ProcessInfo, StdioKind};
use crate::error::{Errno, OsError};
use crate::reactor::platform;
use crate::handle::{Handle, HandleKind, StreamHandle};
use crate::runtime::OutputStream;
use crate::scheduler::EventLoop;

use parking_lot::Mutex;
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc;
use tracing::{debug, warn};

fn invalid() -> OsError {
    OsError::new(Errno::InvalidArgument, "spawn")
}

fn input_stdio(kind: StdioKind) -> Result<Stdio, OsError> {
    match kind {
        StdioKind::Pipe | StdioKind::Fd(0) => Ok(Stdio::piped()),
        StdioKind::Ignore => Ok(Stdio::null()),
        _ => Err(invalid()),
    }
}

fn output_stdio(kind: StdioKind) -> Result<Stdio, OsError> {
    match kind {
        StdioKind::Pipe | StdioKind::Fd(1) | StdioKind::Fd(2) => Ok(Stdio::piped()),
        StdioKind::Ignore => Ok(Stdio::null()),
        _ => Err(invalid()),
    }
}

pub(super) fn spawn(lp: &mut EventLoop, info: ProcessInfo, on_exit: ExitCallback) -> Result<ChildProcess, OsError> {
    let ProcessInfo { args, cwd, env, stdio } = info;
    let [stdin_kind, stdout_kind, stderr_kind] = stdio;

    let (_, host_cwd) = super::working_directory(lp, cwd.as_deref())?;

    let mut command = Command::new(&args[0]);
    command
        .args(&args[1..])
        .current_dir(&host_cwd)
        .env_clear()
        .stdin(input_stdio(stdin_kind)?)
        .stdout(output_stdio(stdout_kind)?)
        .stderr(output_stdio(stderr_kind)?);

    match &env {
        Some(vars) => command.envs(vars),
        None => command.envs(lp.env_vars()),
    };

    let mut child = command.spawn().map_err(|e| {
        debug!(program = %args[0], error = %e, "spawn failed");
        OsError::new(Errno::NotFound, "spawn").with_path(args[0].clone())
    })?;

    let pid = child.id();
    debug!(pid, program = %args[0], "process started");

    let mut handles = Vec::new();
    let (relay_guard, relays) = mpsc::channel::<()>();

    let stdin = match (stdin_kind, child.stdin.take()) {
        (StdioKind::Pipe, Some(pipe)) => Some(StreamHandle::writer(lp, HandleKind::Pipe, pipe)),
        (_, Some(mut pipe)) => {
            // Not part of the exit barrier: the parent's stdin may never end.
            let input = lp.sandbox().stdin().clone();
            lp.script_pool()
                .submit(move || {
                    let _ = relay(input, &mut pipe);
                })
                .map_err(|_| OsError::new(Errno::Io, "spawn"))?;
            None
        }
        (_, None) => None,
    };
    handles.extend(stdin.clone());

    let stdout = wire_output(lp, stdout_kind, child.stdout.take(), &relay_guard, &mut handles)?;
    let stderr = wire_output(lp, stderr_kind, child.stderr.take(), &relay_guard, &mut handles)?;
    drop(relay_guard);

    let reaped = Arc::new(Mutex::new(false));
    let port = super::exit_port(lp, on_exit);
    let handle = lp.handle();

    let watcher = {
        let reaped = reaped.clone();
        move || {
            // Waiting without reaping first keeps the pid valid for `kill`
            // until the flag is set under the same lock.
            let status = match platform::sys_wait_exited(pid) {
                Ok(()) => {
                    let mut reaped = reaped.lock();
                    *reaped = true;
                    child.wait()
                }
                Err(e) => {
                    warn!(pid, error = %e, "cannot wait for child without reaping");
                    let status = child.wait();
                    *reaped.lock() = true;
                    status
                }
            };

            // Relays drop their guard once their stream hits EOF.
            while relays.recv().is_ok() {}

            let exit = match status {
                Ok(status) => exit_of(status),
                Err(e) => {
                    warn!(pid, error = %e, "cannot wait for child");
                    ProcessExit { code: -1, signal: None }
                }
            };

            handle.post(port, Box::new(exit));
        }
    };

    if let Err(err) = lp.script_pool().submit(watcher) {
        warn!(pid, error = %err, "cannot watch child");
        lp.close_port(port);
        lp.unpin();
        for handle in handles {
            handle.close(lp);
        }
        return Err(OsError::new(Errno::Io, "spawn"));
    }

    Ok(ChildProcess {
        pid,
        stdin,
        stdout,
        stderr,
        control: Control::Os { reaped },
    })
}

fn wire_output<R>(
    lp: &mut EventLoop,
    kind: StdioKind,
    pipe: Option<R>,
    guard: &mpsc::Sender<()>,
    handles: &mut Vec<StreamHandle>,
) -> Result<Option<StreamHandle>, OsError>
where
    R: Read + Send + 'static,
{
    let Some(pipe) = pipe else {
        return Ok(None);
    };

    let target: OutputStream = match kind {
        StdioKind::Pipe => {
            let handle = StreamHandle::reader(lp, HandleKind::Pipe, pipe);
            handles.push(handle.clone());
            return Ok(Some(handle));
        }
        StdioKind::Fd(2) => lp.sandbox().stderr().clone(),
        _ => lp.sandbox().stdout().clone(),
    };

    let guard = guard.clone();
    lp.script_pool()
        .submit(move || {
            let _ = relay(pipe, target);
            drop(guard);
        })
        .map_err(|_| OsError::new(Errno::Io, "spawn"))?;

    Ok(None)
}

fn exit_of(status: ExitStatus) -> ProcessExit {
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessExit { code, signal: None },
        (None, Some(signal)) => ProcessExit {
            code: 128 + signal,
            signal: Some(signal),
        },
        (None, None) => ProcessExit { code: -1, signal: None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_exits_map_to_128_plus_signal() {
        let exit = exit_of(ExitStatus::from_raw(libc::SIGKILL));
        assert_eq!(exit, ProcessExit { code: 137, signal: Some(libc::SIGKILL) });

        let exit = exit_of(ExitStatus::from_raw(3 << 8));
        assert_eq!(exit, ProcessExit { code: 3, signal: None });
    }
}
