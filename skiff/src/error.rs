//! Error vocabulary shared by every subsystem.
//!
//! Three families of failure flow through the runtime:
//!
//! - [`OsError`]: an OS-level failure mapped onto the fixed [`Errno`]
//!   vocabulary. These are always handed to callbacks as data.
//! - [`ScriptError`]: anything escaping a script callback. These are routed
//!   through the loop's fatal-error hook.
//! - [`SessionError`]: failures while constructing or starting a session.

use std::io;

use thiserror::Error;

use crate::runtime::PoolError;

/// The fixed error vocabulary exposed to scripts.
///
/// Every variant carries a symbolic code (see [`Errno::code`]) and a numeric
/// compatibility value (see [`Errno::number`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    NotPermitted,
    NotFound,
    NoSuchProcess,
    Interrupted,
    Io,
    BadDescriptor,
    AccessDenied,
    Exists,
    NotDirectory,
    IsDirectory,
    InvalidArgument,
    BrokenPipe,
    AddressInUse,
    ConnectionRefused,
    NotEmpty,
    IllegalSequence,
    Eof,
}

impl Errno {
    /// Symbolic code as seen by scripts, e.g. `"ENOENT"`.
    pub fn code(self) -> &'static str {
        match self {
            Errno::NotPermitted => "EPERM",
            Errno::NotFound => "ENOENT",
            Errno::NoSuchProcess => "ESRCH",
            Errno::Interrupted => "EINTR",
            Errno::Io => "EIO",
            Errno::BadDescriptor => "EBADF",
            Errno::AccessDenied => "EACCES",
            Errno::Exists => "EEXIST",
            Errno::NotDirectory => "ENOTDIR",
            Errno::IsDirectory => "EISDIR",
            Errno::InvalidArgument => "EINVAL",
            Errno::BrokenPipe => "EPIPE",
            Errno::AddressInUse => "EADDRINUSE",
            Errno::ConnectionRefused => "ECONNREFUSED",
            Errno::NotEmpty => "ENOTEMPTY",
            Errno::IllegalSequence => "EILSEQ",
            Errno::Eof => "EOF",
        }
    }

    /// Numeric compatibility value.
    ///
    /// These are fixed and independent of the host platform's errno table.
    pub fn number(self) -> i32 {
        match self {
            Errno::NotPermitted => 1,
            Errno::NotFound => 2,
            Errno::NoSuchProcess => 3,
            Errno::Interrupted => 4,
            Errno::Io => 5,
            Errno::BadDescriptor => 9,
            Errno::AccessDenied => 13,
            Errno::Exists => 17,
            Errno::NotDirectory => 20,
            Errno::IsDirectory => 21,
            Errno::InvalidArgument => 22,
            Errno::BrokenPipe => 32,
            Errno::AddressInUse => 48,
            Errno::ConnectionRefused => 61,
            Errno::NotEmpty => 66,
            Errno::IllegalSequence => 92,
            Errno::Eof => -1,
        }
    }

    /// Maps a host I/O error onto the vocabulary.
    ///
    /// The raw OS error number is consulted first, then the portable
    /// [`io::ErrorKind`]. Anything unrecognised becomes [`Errno::Io`].
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(raw) = err.raw_os_error() {
            match raw {
                libc::EPERM => return Errno::NotPermitted,
                libc::ENOENT => return Errno::NotFound,
                libc::ESRCH => return Errno::NoSuchProcess,
                libc::EINTR => return Errno::Interrupted,
                libc::EBADF => return Errno::BadDescriptor,
                libc::EACCES => return Errno::AccessDenied,
                libc::EEXIST => return Errno::Exists,
                libc::ENOTDIR => return Errno::NotDirectory,
                libc::EISDIR => return Errno::IsDirectory,
                libc::EINVAL => return Errno::InvalidArgument,
                libc::EPIPE => return Errno::BrokenPipe,
                libc::EADDRINUSE => return Errno::AddressInUse,
                libc::ECONNREFUSED => return Errno::ConnectionRefused,
                libc::ENOTEMPTY => return Errno::NotEmpty,
                libc::EILSEQ => return Errno::IllegalSequence,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::NotFound => Errno::NotFound,
            io::ErrorKind::PermissionDenied => Errno::NotPermitted,
            io::ErrorKind::AlreadyExists => Errno::Exists,
            io::ErrorKind::InvalidInput => Errno::InvalidArgument,
            io::ErrorKind::UnexpectedEof => Errno::Eof,
            io::ErrorKind::BrokenPipe => Errno::BrokenPipe,
            io::ErrorKind::AddrInUse => Errno::AddressInUse,
            io::ErrorKind::ConnectionRefused => Errno::ConnectionRefused,
            io::ErrorKind::Interrupted => Errno::Interrupted,
            io::ErrorKind::NotADirectory => Errno::NotDirectory,
            io::ErrorKind::IsADirectory => Errno::IsDirectory,
            io::ErrorKind::DirectoryNotEmpty => Errno::NotEmpty,
            _ => Errno::Io,
        }
    }
}

/// An OS-level failure, delivered to callbacks as data.
///
/// Carries the mapped [`Errno`], the name of the operation that failed and,
/// when relevant, the script-visible path involved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render(.errno, .syscall, .path))]
pub struct OsError {
    errno: Errno,
    syscall: &'static str,
    path: Option<String>,
}

fn render(errno: &Errno, syscall: &str, path: &Option<String>) -> String {
    match path {
        Some(path) => format!("{}, {} '{}'", errno.code(), syscall, path),
        None => format!("{}, {}", errno.code(), syscall),
    }
}

impl OsError {
    pub fn new(errno: Errno, syscall: &'static str) -> Self {
        Self {
            errno,
            syscall,
            path: None,
        }
    }

    /// Builds an error from a host I/O failure.
    pub fn from_io(syscall: &'static str, err: &io::Error) -> Self {
        Self::new(Errno::from_io(err), syscall)
    }

    /// Attaches the script-visible path the operation was working on.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }

    pub fn code(&self) -> &'static str {
        self.errno.code()
    }

    pub fn syscall(&self) -> &'static str {
        self.syscall
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

/// A failure escaping script code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// An uncaught exception raised by script code.
    #[error("uncaught exception: {0}")]
    Thrown(String),

    /// An OS error the script chose to propagate instead of handling.
    #[error(transparent)]
    Os(#[from] OsError),

    /// An explicit termination request carrying an exit code.
    #[error("exit requested with code {0}")]
    Exit(i32),
}

impl ScriptError {
    /// Convenience constructor for [`ScriptError::Thrown`].
    pub fn thrown(message: impl Into<String>) -> Self {
        ScriptError::Thrown(message.into())
    }
}

/// Result type returned by every script callback.
pub type ScriptResult = Result<(), ScriptError>;

/// Failures while creating or starting a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A command-line flag that takes a value was given without one.
    #[error("{flag} requires an argument")]
    MissingArgument { flag: String },

    /// No registered implementation matches the requested version.
    #[error("no implementation matches version {0}")]
    NoImplementation(String),

    /// The implementation could not produce a script for these options.
    #[error("cannot load script: {reason}")]
    Load { reason: String },

    /// The session's worker could not be scheduled.
    #[error("cannot schedule session: {source}")]
    Pool {
        #[from]
        source: PoolError,
    },

    /// Underlying I/O error while setting up the loop.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}
