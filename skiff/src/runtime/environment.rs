use super::builder::EnvironmentBuilder;
use super::options::ScriptOptions;
use super::pool::WorkerPool;
use super::registry::{Implementation, VersionRegistry};
use super::session::Session;
use super::status::ScriptStatus;
use crate::error::{ScriptError, ScriptResult, SessionError};
use crate::scheduler::EventLoop;

use std::fmt;
use std::sync::Arc;

/// Process-wide state shared by every session.
///
/// Owns the two worker pools and the implementation registry. Cloning is
/// cheap; all clones refer to the same pools.
///
/// # Examples
///
/// ```rust,ignore
/// let env = Environment::builder().implementation(engine).build();
///
/// let future = env.create_session(["server.js"])?.execute()?;
/// let status = future.get();
/// ```
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

struct EnvironmentInner {
    /// Bounded, fails fast; filesystem operations.
    async_pool: WorkerPool,
    /// Unbounded; session loops, stream relays, process watchers.
    script_pool: WorkerPool,
    registry: VersionRegistry,
    executable_name: String,
    default_version: String,
}

impl Environment {
    pub(crate) fn new(
        async_pool: WorkerPool,
        script_pool: WorkerPool,
        registry: VersionRegistry,
        executable_name: String,
        default_version: String,
    ) -> Self {
        Self {
            inner: Arc::new(EnvironmentInner {
                async_pool,
                script_pool,
                registry,
                executable_name,
                default_version,
            }),
        }
    }

    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    /// A session for the command line `args`, excluding the executable.
    ///
    /// # Errors
    ///
    /// Fails if the arguments do not parse.
    pub fn create_session<I, S>(&self, args: I) -> Result<Session, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options = ScriptOptions::parse(args)?;
        Ok(Session::new(self.clone(), options, None))
    }

    /// A session running `script` directly, bypassing the registry.
    pub fn create_session_with<F>(&self, script: F) -> Session
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult + Send + 'static,
    {
        Session::new(self.clone(), ScriptOptions::default(), Some(Box::new(script)))
    }

    /// Runs `script` in a fresh default session and waits for it.
    pub fn run<F>(&self, script: F) -> ScriptStatus
    where
        F: FnOnce(&mut EventLoop) -> ScriptResult + Send + 'static,
    {
        match self.create_session_with(script).run() {
            Ok(status) => status,
            Err(err) => ScriptStatus::Failed(ScriptError::thrown(err.to_string())),
        }
    }

    pub fn async_pool(&self) -> &WorkerPool {
        &self.inner.async_pool
    }

    pub fn script_pool(&self) -> &WorkerPool {
        &self.inner.script_pool
    }

    pub fn registry(&self) -> &VersionRegistry {
        &self.inner.registry
    }

    pub fn executable_name(&self) -> &str {
        &self.inner.executable_name
    }

    pub fn default_version(&self) -> &str {
        &self.inner.default_version
    }

    pub(crate) fn select(&self, version: Option<&str>) -> Result<Arc<dyn Implementation>, SessionError> {
        let inner = &self.inner;

        inner
            .registry
            .select(version, &inner.default_version)
            .ok_or_else(|| SessionError::NoImplementation(version.unwrap_or(&inner.default_version).to_string()))
    }
}

impl Default for Environment {
    fn default() -> Self {
        EnvironmentBuilder::new().build()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("async_pool", &self.inner.async_pool)
            .field("script_pool", &self.inner.script_pool)
            .field("registry", &self.inner.registry)
            .field("executable_name", &self.inner.executable_name)
            .finish()
    }
}
