//! # Skiff
//!
//! **Skiff** is a single-threaded event-loop runtime for hosting script
//! programs that expect the classic callback-driven contract: timers,
//! microtasks, non-blocking sockets, asynchronous filesystem calls and
//! child processes, all observed from one thread.
//!
//! Each running script is a *session*. A session owns one [`EventLoop`],
//! which is the only place script-visible code runs. Blocking work happens
//! on shared worker pools owned by the [`Environment`] and comes back to
//! the loop as queued callbacks, so callbacks never run concurrently.
//!
//! Skiff provides:
//!
//! - An **event loop** with ticks, immediates, timers, cross-thread tasks
//!   and a pin count deciding when it may exit
//! - A **readiness reactor** (epoll) driving TCP handles
//! - An **async filesystem dispatcher** with path virtualization and
//!   per-session descriptors
//! - **Process spawning**, of OS processes or nested sessions
//! - **Sessions** with a cancellable future and an exit status
//! - **Ergonomic macros**: `#[skiff::main]` and `#[skiff::test]`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use skiff::{EventLoop, ScriptResult};
//! use std::time::Duration;
//!
//! #[skiff::main]
//! fn main(lp: &mut EventLoop) -> ScriptResult {
//!     lp.set_timeout(Duration::from_millis(100), |lp| {
//!         println!("argv: {:?}", lp.argv());
//!         Ok(())
//!     });
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`scheduler`]: the event loop, timers and cross-thread handles
//! - [`handle`]: the capability interface shared by sockets, pipes, files
//!   and the console
//! - [`fs`]: filesystem operations and path translation
//! - [`process`]: OS processes and nested sessions
//! - [`runtime`]: environments, sessions, sandboxes and worker pools
//! - [`error`]: the error vocabulary
//!
//! Skiff targets Linux.

mod reactor;
mod utils;

pub mod error;
pub mod fs;
pub mod handle;
pub mod process;
pub mod runtime;
pub mod scheduler;

pub use error::{Errno, OsError, ScriptError, ScriptResult, SessionError};
pub use handle::{Handle, HandleKind, READ_AHEAD, ReadEvent, StreamHandle};
pub use process::{ChildProcess, ProcessExit, ProcessInfo, StdioKind};
pub use reactor::{SocketAddress, SocketHandle};
pub use runtime::{
    Environment, EnvironmentBuilder, InputStream, OutputStream, Sandbox, ScriptFuture, ScriptStatus, Session,
};
pub use scheduler::{EventLoop, LoopHandle, Timer};

pub use skiff_macros::*;
