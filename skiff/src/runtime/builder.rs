use super::environment::Environment;
use super::pool::WorkerPool;
use super::registry::{Implementation, VersionRegistry};

use std::sync::Arc;
use std::time::Duration;

/// Builder for configuring and creating an [`Environment`].
///
/// `EnvironmentBuilder` sizes the shared worker pools and registers the
/// script implementations sessions may select from.
///
/// # Examples
///
/// ```rust,ignore
/// let env = EnvironmentBuilder::new()
///     .async_threads(16)
///     .implementation(MyEngine::new())
///     .build();
/// ```
pub struct EnvironmentBuilder {
    /// Maximum threads of the bounded async pool.
    async_threads: usize,
    /// Jobs the async pool queues once every thread is busy.
    async_queue: usize,
    idle_timeout: Duration,
    executable_name: String,
    default_version: String,
    registry: VersionRegistry,
}

impl EnvironmentBuilder {
    /// Creates a new `EnvironmentBuilder` with default configuration.
    ///
    /// By default the async pool runs up to 64 threads with 8 queue slots,
    /// idle workers retire after 60 seconds, the executable is called
    /// `node` and version `0.10.x` is preferred.
    pub fn new() -> Self {
        Self {
            async_threads: 64,
            async_queue: 8,
            idle_timeout: Duration::from_secs(60),
            executable_name: "node".to_string(),
            default_version: "0.10.x".to_string(),
            registry: VersionRegistry::new(),
        }
    }

    /// Sets the maximum number of async pool threads.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn async_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "async_threads must be > 0");

        self.async_threads = n;
        self
    }

    /// Sets how many filesystem jobs may wait for a thread before the
    /// pool starts rejecting them.
    pub fn async_queue(mut self, n: usize) -> Self {
        self.async_queue = n;
        self
    }

    /// How long an idle worker of either pool waits before retiring.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Name under which a script spawning the runtime itself starts a
    /// nested session instead of an OS process.
    pub fn executable_name(mut self, name: impl Into<String>) -> Self {
        self.executable_name = name.into();
        self
    }

    /// Version pattern used when a session requests none.
    pub fn default_version(mut self, version: impl Into<String>) -> Self {
        self.default_version = version.into();
        self
    }

    /// Registers a script implementation.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let builder = EnvironmentBuilder::new()
    ///     .implementation(Engine::v0_10())
    ///     .implementation(Engine::v0_12());
    /// ```
    pub fn implementation<I>(mut self, implementation: I) -> Self
    where
        I: Implementation,
    {
        self.registry.register(Arc::new(implementation));
        self
    }

    /// Builds the environment with the configured options.
    ///
    /// No threads are started until the first session needs them.
    pub fn build(self) -> Environment {
        let async_pool = WorkerPool::bounded("skiff-async", self.async_threads, self.async_queue, self.idle_timeout);
        let script_pool = WorkerPool::unbounded("skiff-script", self.idle_timeout);

        Environment::new(
            async_pool,
            script_pool,
            self.registry,
            self.executable_name,
            self.default_version,
        )
    }
}

impl Default for EnvironmentBuilder {
    /// Creates a default `EnvironmentBuilder`.
    fn default() -> Self {
        Self::new()
    }
}
