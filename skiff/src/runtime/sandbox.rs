use super::pool::WorkerPool;
use super::stdio::{InputStream, OutputStream};
use crate::fs::PathTranslator;

use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Decides which addresses a session may listen on or connect to.
///
/// A denied target surfaces to the script as `EINVAL`.
pub trait NetworkPolicy: Send + Sync {
    fn allow_listening(&self, address: &SocketAddr) -> bool;

    fn allow_connection(&self, address: &SocketAddr) -> bool;
}

/// The outer boundary of a session.
///
/// Controls how script paths map onto the host, where the console
/// streams go, which pool runs filesystem work and which network targets
/// are allowed. The default sandbox is transparent: host paths, host
/// working directory, the process's own stdio.
///
/// ```rust,ignore
/// let sandbox = Sandbox::new()
///     .with_root("/srv/jail")
///     .with_mount("/data", "/mnt/shared")
///     .with_working_directory("/data")
///     .with_stdout(OutputStream::new(captured.clone()));
/// ```
#[derive(Clone)]
pub struct Sandbox {
    root: Option<PathBuf>,
    mounts: Vec<(String, PathBuf)>,
    working_directory: Option<String>,

    stdin: InputStream,
    stdout: OutputStream,
    stderr: OutputStream,

    async_pool: Option<WorkerPool>,
    network_policy: Option<Arc<dyn NetworkPolicy>>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            root: None,
            mounts: Vec::new(),
            working_directory: None,
            stdin: InputStream::stdin(),
            stdout: OutputStream::stdout(),
            stderr: OutputStream::stderr(),
            async_pool: None,
            network_policy: None,
        }
    }

    /// Host directory that script-visible `/` maps onto.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Maps the script path `prefix` onto the host directory `dir`.
    pub fn with_mount(mut self, prefix: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.mounts.push((prefix.into(), dir.into()));
        self
    }

    /// Initial script-visible working directory.
    pub fn with_working_directory(mut self, path: impl Into<String>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn with_stdin(mut self, stdin: InputStream) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_stdout(mut self, stdout: OutputStream) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn with_stderr(mut self, stderr: OutputStream) -> Self {
        self.stderr = stderr;
        self
    }

    /// Runs this session's filesystem work on `pool` instead of the
    /// environment's async pool.
    pub fn with_async_pool(mut self, pool: WorkerPool) -> Self {
        self.async_pool = Some(pool);
        self
    }

    pub fn with_network_policy(mut self, policy: Arc<dyn NetworkPolicy>) -> Self {
        self.network_policy = Some(policy);
        self
    }

    pub fn root(&self) -> Option<&PathBuf> {
        self.root.as_ref()
    }

    pub fn working_directory(&self) -> Option<&str> {
        self.working_directory.as_deref()
    }

    pub fn stdin(&self) -> &InputStream {
        &self.stdin
    }

    pub fn stdout(&self) -> &OutputStream {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputStream {
        &self.stderr
    }

    pub fn async_pool(&self) -> Option<&WorkerPool> {
        self.async_pool.as_ref()
    }

    pub fn network_policy(&self) -> Option<&Arc<dyn NetworkPolicy>> {
        self.network_policy.as_ref()
    }

    /// A path translator reflecting the root, mounts and working directory.
    pub fn translator(&self) -> PathTranslator {
        let working_dir = match (&self.working_directory, &self.root) {
            (Some(dir), _) => dir.clone(),
            (None, Some(_)) => "/".to_string(),
            (None, None) => std::env::current_dir()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "/".to_string()),
        };

        let mut translator = PathTranslator::new(working_dir);
        if let Some(root) = &self.root {
            translator = translator.with_root(root.clone());
        }
        for (prefix, dir) in &self.mounts {
            translator = translator.with_mount(prefix, dir.clone());
        }

        translator
    }

    /// Flushes the output streams and drops this sandbox's references to
    /// all three streams.
    ///
    /// Other holders, such as a nested session sharing them, keep their
    /// own clones and are unaffected.
    pub(crate) fn release_streams(&mut self) {
        let _ = self.stdout.flush();
        let _ = self.stderr.flush();

        self.stdin = InputStream::empty();
        self.stdout = OutputStream::sink();
        self.stderr = OutputStream::sink();
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("root", &self.root)
            .field("mounts", &self.mounts)
            .field("working_directory", &self.working_directory)
            .field("async_pool", &self.async_pool)
            .field("network_policy", &self.network_policy.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SharedBuffer;

    #[test]
    fn rooted_sandbox_starts_at_slash() {
        let sandbox = Sandbox::new().with_root("/srv/jail");
        let translator = sandbox.translator();

        assert_eq!(translator.working_dir(), "/");
        assert_eq!(translator.translate("etc/hosts"), Some(PathBuf::from("/srv/jail/etc/hosts")));
    }

    #[test]
    fn mounts_carry_into_the_translator() {
        let sandbox = Sandbox::new()
            .with_root("/srv/jail")
            .with_mount("/data", "/mnt/data")
            .with_working_directory("/data/in");

        let translator = sandbox.translator();
        assert_eq!(translator.translate("x.csv"), Some(PathBuf::from("/mnt/data/in/x.csv")));
    }

    #[test]
    fn releasing_streams_leaves_clones_intact() {
        let captured = SharedBuffer::default();
        let mut sandbox = Sandbox::new().with_stdout(OutputStream::new(captured.clone()));
        let mut shared = sandbox.stdout().clone();

        sandbox.release_streams();
        shared.write_all(b"still here").unwrap();

        assert_eq!(captured.to_string_lossy(), "still here");
    }
}
