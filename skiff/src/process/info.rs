use crate::error::{Errno, OsError};

use std::collections::HashMap;

/// What one of a child's three standard streams is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioKind {
    /// A pipe exposed to the parent as a stream handle.
    Pipe,
    /// Nothing; reads see EOF and writes are discarded.
    Ignore,
    /// The parent's own stream with this number.
    Fd(i32),
    /// The ipc channel.
    Ipc,
}

impl StdioKind {
    /// Parses the textual form: `"pipe"`, `"ignore"`, `"fd"` (with `fd`)
    /// or `"ipc"`.
    pub fn parse(kind: &str, fd: Option<i32>) -> Result<Self, OsError> {
        let invalid = || OsError::new(Errno::InvalidArgument, "spawn");

        match kind {
            "pipe" => Ok(StdioKind::Pipe),
            "ignore" => Ok(StdioKind::Ignore),
            "fd" => fd.map(StdioKind::Fd).ok_or_else(invalid),
            "ipc" => Ok(StdioKind::Ipc),
            _ => Err(invalid()),
        }
    }
}

/// Everything needed to start a child.
///
/// # Examples
///
/// ```rust,ignore
/// let info = ProcessInfo::new(["sh", "-c", "cat"])
///     .cwd("/tmp")
///     .stdio([StdioKind::Pipe, StdioKind::Pipe, StdioKind::Ignore]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Program followed by its arguments.
    pub args: Vec<String>,
    /// Script-visible working directory; the parent's if unset.
    pub cwd: Option<String>,
    /// Full environment; the parent's variables if unset.
    pub env: Option<HashMap<String, String>>,
    pub stdio: [StdioKind; 3],
}

impl ProcessInfo {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: None,
            stdio: [StdioKind::Pipe; 3],
        }
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn stdio(mut self, stdio: [StdioKind; 3]) -> Self {
        self.stdio = stdio;
        self
    }

    /// Connects all three streams to the parent's.
    pub fn inherit(self) -> Self {
        self.stdio([StdioKind::Fd(0), StdioKind::Fd(1), StdioKind::Fd(2)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_textual_stdio() {
        assert_eq!(StdioKind::parse("pipe", None).unwrap(), StdioKind::Pipe);
        assert_eq!(StdioKind::parse("ignore", None).unwrap(), StdioKind::Ignore);
        assert_eq!(StdioKind::parse("fd", Some(2)).unwrap(), StdioKind::Fd(2));
        assert_eq!(StdioKind::parse("ipc", None).unwrap(), StdioKind::Ipc);
    }

    #[test]
    fn rejects_unknown_stdio() {
        let err = StdioKind::parse("inherit", None).unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgument);

        let err = StdioKind::parse("fd", None).unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgument);
    }

    #[test]
    fn defaults_to_pipes() {
        let info = ProcessInfo::new(["echo", "hi"]);

        assert_eq!(info.args, ["echo", "hi"]);
        assert_eq!(info.stdio, [StdioKind::Pipe; 3]);
        assert!(info.cwd.is_none() && info.env.is_none());
    }
}
