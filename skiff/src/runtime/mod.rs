//! Sessions and the environment they run in.
//!
//! An [`Environment`] is built once per process and owns the shared worker
//! pools and the implementation registry. Each [`Session`] runs one script
//! on its own loop thread, borrowed from the environment's script pool,
//! and reports its outcome through a [`ScriptFuture`].
//!
//! It is responsible for:
//! - parsing the command-line surface into [`ScriptOptions`],
//! - selecting an [`Implementation`] by version,
//! - configuring the [`Sandbox`] a session sees,
//! - starting, awaiting and cancelling sessions.

mod builder;
mod environment;
mod future;
mod options;
mod pool;
mod registry;
mod sandbox;
mod session;
mod status;
mod stdio;

pub use builder::EnvironmentBuilder;
pub use environment::Environment;
pub use future::ScriptFuture;
pub use options::ScriptOptions;
pub use pool::{PoolError, WorkerPool};
pub use registry::{Implementation, Script, VersionRegistry};
pub use sandbox::{NetworkPolicy, Sandbox};
pub use session::{DEFAULT_UMASK, Session};
pub use status::{CANCELLED_EXIT_CODE, FAILED_EXIT_CODE, ScriptStatus};
pub use stdio::{InputStream, OutputStream, SharedBuffer};

pub(crate) use session::SessionContext;
