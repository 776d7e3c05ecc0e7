use super::table::ProcessTable;
use super::{ChildProcess, Control, ExitCallback, ProcessExit, ProcessInfo, StdioKind};
use crate::error::{Errno, OsError};
use crate::handle::{Handle, HandleKind, StreamHandle};
use crate::reactor::platform;
use crate::runtime::{InputStream, OutputStream, Sandbox};
use crate::scheduler::EventLoop;

use tracing::{debug, warn};

fn invalid() -> OsError {
    OsError::new(Errno::InvalidArgument, "spawn")
}

fn pipe_error(e: std::io::Error) -> OsError {
    OsError::from_io("pipe", &e)
}

/// Child side of the three streams, plus the parent's pipe ends.
struct Wiring {
    sandbox: Sandbox,
    handles: [Option<StreamHandle>; 3],
    ipc: bool,
}

impl Wiring {
    fn stdin(&mut self, lp: &mut EventLoop, kind: StdioKind) -> Result<(), OsError> {
        let input = match kind {
            StdioKind::Pipe => {
                let (reader, writer) = platform::sys_pipe().map_err(pipe_error)?;
                self.handles[0] = Some(StreamHandle::writer(lp, HandleKind::Pipe, writer));
                InputStream::new(reader)
            }
            StdioKind::Ignore => InputStream::empty(),
            StdioKind::Fd(0) => return Ok(()),
            StdioKind::Ipc => {
                self.ipc = true;
                InputStream::empty()
            }
            StdioKind::Fd(_) => return Err(invalid()),
        };

        self.sandbox = std::mem::take(&mut self.sandbox).with_stdin(input);
        Ok(())
    }

    fn output(&mut self, lp: &mut EventLoop, slot: usize, kind: StdioKind) -> Result<(), OsError> {
        let output = match kind {
            StdioKind::Pipe => {
                let (reader, writer) = platform::sys_pipe().map_err(pipe_error)?;
                self.handles[slot] = Some(StreamHandle::reader(lp, HandleKind::Pipe, reader));
                OutputStream::new(writer)
            }
            StdioKind::Ignore => OutputStream::sink(),
            StdioKind::Fd(1) => lp.sandbox().stdout().clone(),
            StdioKind::Fd(2) => lp.sandbox().stderr().clone(),
            StdioKind::Ipc => {
                self.ipc = true;
                OutputStream::sink()
            }
            StdioKind::Fd(_) => return Err(invalid()),
        };

        let sandbox = std::mem::take(&mut self.sandbox);
        self.sandbox = if slot == 1 {
            sandbox.with_stdout(output)
        } else {
            sandbox.with_stderr(output)
        };
        Ok(())
    }

    fn abandon(self, lp: &mut EventLoop) {
        for handle in self.handles.into_iter().flatten() {
            handle.close(lp);
        }
    }
}

pub(super) fn spawn(lp: &mut EventLoop, info: ProcessInfo, on_exit: ExitCallback) -> Result<ChildProcess, OsError> {
    let ProcessInfo { args, cwd, env, stdio } = info;
    let script_args = args[1..].to_vec();

    if !script_args.iter().any(|arg| !arg.starts_with('-')) {
        return Err(invalid());
    }

    let (cwd, _) = super::working_directory(lp, cwd.as_deref())?;

    let mut wiring = Wiring {
        sandbox: lp.sandbox().clone().with_working_directory(cwd),
        handles: [None, None, None],
        ipc: false,
    };

    let wired = wiring
        .stdin(lp, stdio[0])
        .and_then(|()| wiring.output(lp, 1, stdio[1]))
        .and_then(|()| wiring.output(lp, 2, stdio[2]));
    if let Err(err) = wired {
        wiring.abandon(lp);
        return Err(err);
    }

    let env_vars = env.unwrap_or_else(|| lp.env_vars().clone());
    let table = ProcessTable::global();
    let pid = table.allocate();

    let created = lp.environment().create_session(script_args);
    let session = match created {
        Ok(session) => session
            .with_sandbox(std::mem::take(&mut wiring.sandbox))
            .with_environment(env_vars)
            .with_umask(lp.umask())
            .with_pid(pid)
            .with_ipc(wiring.ipc),
        Err(err) => {
            debug!(error = %err, "nested session rejected its arguments");
            wiring.abandon(lp);
            return Err(invalid());
        }
    };

    let port = super::exit_port(lp, on_exit);

    let future = match session.execute() {
        Ok(future) => future,
        Err(err) => {
            warn!(pid, error = %err, "cannot start nested session");
            lp.close_port(port);
            lp.unpin();
            wiring.abandon(lp);
            return Err(OsError::new(Errno::Io, "spawn"));
        }
    };

    debug!(pid, "nested session started");
    table.insert(pid, future.clone());

    let handle = lp.handle();
    future.set_listener(move |status| {
        ProcessTable::global().remove(pid);
        handle.post(
            port,
            Box::new(ProcessExit {
                code: status.exit_code(),
                signal: None,
            }),
        );
    });

    let [stdin, stdout, stderr] = wiring.handles;
    Ok(ChildProcess {
        pid,
        stdin,
        stdout,
        stderr,
        control: Control::Nested { future },
    })
}
