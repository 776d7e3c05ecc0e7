use super::environment::Environment;
use super::future::ScriptFuture;
use super::options::ScriptOptions;
use super::registry::Script;
use super::sandbox::Sandbox;
use super::status::ScriptStatus;
use crate::error::{OsError, ScriptError, ScriptResult, SessionError};
use crate::reactor::Poller;
use crate::scheduler::EventLoop;

use std::collections::HashMap;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error};

/// Default file-creation mask.
pub const DEFAULT_UMASK: u32 = 0o022;

/// Everything a running loop knows about its session.
pub(crate) struct SessionContext {
    pub(crate) env: Environment,
    pub(crate) options: ScriptOptions,
    pub(crate) sandbox: Sandbox,
    pub(crate) vars: HashMap<String, String>,
    pub(crate) pinned: bool,
    pub(crate) umask: u32,
    pub(crate) pid: u32,
    pub(crate) future: ScriptFuture,
    pub(crate) ipc: bool,
}

/// A configured, not yet started session.
///
/// Created by [`Environment::create_session`] or
/// [`Environment::create_session_with`]; started with
/// [`Session::execute`], which returns immediately, or [`Session::run`],
/// which blocks until the session ends.
///
/// # Examples
///
/// ```rust,ignore
/// let status = env
///     .create_session(["app.js", "--port", "8080"])?
///     .with_sandbox(Sandbox::new().with_root("/srv/app"))
///     .with_umask(0o077)
///     .run()?;
/// ```
pub struct Session {
    env: Environment,
    options: ScriptOptions,
    script: Option<Box<dyn Script>>,
    sandbox: Sandbox,
    vars: Option<HashMap<String, String>>,
    pinned: bool,
    version: Option<String>,
    umask: u32,
    pid: Option<u32>,
    ipc: bool,
}

impl Session {
    pub(crate) fn new(env: Environment, options: ScriptOptions, script: Option<Box<dyn Script>>) -> Self {
        Self {
            env,
            options,
            script,
            sandbox: Sandbox::new(),
            vars: None,
            pinned: false,
            version: None,
            umask: DEFAULT_UMASK,
            pid: None,
            ipc: false,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Environment variables for the script; defaults to the host's.
    pub fn with_environment(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = Some(vars);
        self
    }

    /// A pinned session keeps running until the script exits explicitly
    /// or the session is cancelled.
    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Version pattern selecting the implementation, e.g. `"0.10.x"`.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_umask(mut self, umask: u32) -> Self {
        self.umask = umask;
        self
    }

    /// Replaces the script path and arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.options.args = args;
        self
    }

    pub(crate) fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub(crate) fn with_ipc(mut self, ipc: bool) -> Self {
        self.ipc = ipc;
        self
    }

    pub fn options(&self) -> &ScriptOptions {
        &self.options
    }

    /// Starts the session on the environment's script pool.
    ///
    /// # Errors
    ///
    /// No implementation matches the requested version, the implementation
    /// cannot load the script, the poller cannot be created or the pool
    /// refuses the session.
    pub fn execute(self) -> Result<ScriptFuture, SessionError> {
        let script = match self.script {
            Some(script) => script,
            None => load(&self.env, &self.options, self.version.as_deref())?,
        };

        let poller = Poller::new()?;
        let future = ScriptFuture::new();
        let pid = self.pid.unwrap_or_else(std::process::id);

        let context = SessionContext {
            env: self.env.clone(),
            options: self.options,
            sandbox: self.sandbox,
            vars: self.vars.unwrap_or_else(|| std::env::vars().collect()),
            pinned: self.pinned,
            umask: self.umask,
            pid,
            future: future.clone(),
            ipc: self.ipc,
        };

        let completion = future.clone();
        self.env.script_pool().submit(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                EventLoop::new(context, poller).run(script)
            }));

            let status = outcome.unwrap_or_else(|_| {
                error!(pid, "session panicked");
                ScriptStatus::Failed(ScriptError::thrown("session panicked"))
            });

            completion.complete(status);
        })?;

        debug!(pid, "session scheduled");
        Ok(future)
    }

    /// Runs the session to completion on the script pool and waits for it.
    pub fn run(self) -> Result<ScriptStatus, SessionError> {
        Ok(self.execute()?.get())
    }
}

fn load(env: &Environment, options: &ScriptOptions, version: Option<&str>) -> Result<Box<dyn Script>, SessionError> {
    let implementation = env.select(version)?;

    if options.print_version {
        let version = implementation.version().to_string();
        return Ok(Box::new(move |lp: &mut EventLoop| -> ScriptResult {
            let mut out = lp.sandbox().stdout().clone();
            writeln!(out, "v{version}").map_err(|e| OsError::from_io("write", &e))?;
            Ok(())
        }));
    }

    implementation.load(options)
}
