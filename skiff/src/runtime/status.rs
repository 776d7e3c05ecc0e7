use crate::error::ScriptError;

use std::fmt;

/// Exit code reported for a session that failed with an unhandled error.
pub const FAILED_EXIT_CODE: i32 = -1;

/// Exit code reported for a cancelled session.
pub const CANCELLED_EXIT_CODE: i32 = -2;

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStatus {
    /// The loop ran out of work.
    Ok,

    /// The script requested termination with a code.
    Exit(i32),

    /// An error escaped every handler.
    Failed(ScriptError),

    /// The session's future was cancelled.
    Cancelled,
}

impl ScriptStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            ScriptStatus::Ok => 0,
            ScriptStatus::Exit(code) => *code,
            ScriptStatus::Failed(_) => FAILED_EXIT_CODE,
            ScriptStatus::Cancelled => CANCELLED_EXIT_CODE,
        }
    }

    /// Whether the exit code is zero.
    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    pub fn error(&self) -> Option<&ScriptError> {
        match self {
            ScriptStatus::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptStatus::Ok => f.write_str("ok"),
            ScriptStatus::Exit(code) => write!(f, "exited with code {code}"),
            ScriptStatus::Failed(err) => write!(f, "failed: {err}"),
            ScriptStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(ScriptStatus::Ok.exit_code(), 0);
        assert_eq!(ScriptStatus::Exit(7).exit_code(), 7);
        assert_eq!(ScriptStatus::Failed(ScriptError::thrown("x")).exit_code(), -1);
        assert_eq!(ScriptStatus::Cancelled.exit_code(), -2);

        assert!(ScriptStatus::Exit(0).is_success());
        assert!(!ScriptStatus::Cancelled.is_success());
    }
}
