use super::options::ScriptOptions;
use crate::error::{ScriptResult, SessionError};
use crate::scheduler::EventLoop;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// The entry point of a session.
///
/// Runs once on the loop thread before the loop starts; everything it
/// schedules keeps the session going afterwards. Any
/// `FnOnce(&mut EventLoop) -> ScriptResult` is a script.
pub trait Script: Send + 'static {
    fn main(self: Box<Self>, lp: &mut EventLoop) -> ScriptResult;
}

impl<F> Script for F
where
    F: FnOnce(&mut EventLoop) -> ScriptResult + Send + 'static,
{
    fn main(self: Box<Self>, lp: &mut EventLoop) -> ScriptResult {
        (*self)(lp)
    }
}

/// Turns command-line options into a runnable script.
///
/// This is the seam where a script engine plugs in: the runtime parses
/// the options and hands them over, the implementation decides what
/// `args[0]` or `-e` means.
pub trait Implementation: Send + Sync + 'static {
    /// Version string, e.g. `"0.10.48"`.
    fn version(&self) -> &str;

    fn load(&self, options: &ScriptOptions) -> Result<Box<dyn Script>, SessionError>;
}

/// Registered implementations, selected by version pattern.
#[derive(Clone, Default)]
pub struct VersionRegistry {
    implementations: Vec<Arc<dyn Implementation>>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, implementation: Arc<dyn Implementation>) {
        self.implementations.push(implementation);
    }

    pub fn is_empty(&self) -> bool {
        self.implementations.is_empty()
    }

    /// Registered versions, highest first.
    pub fn versions(&self) -> Vec<String> {
        let mut versions: Vec<_> = self.implementations.iter().map(|i| i.version().to_string()).collect();
        versions.sort_by(|a, b| compare(b, a));
        versions
    }

    /// The highest implementation matching `pattern`.
    ///
    /// Without a pattern `default` is tried first, then the highest
    /// registered version.
    pub fn select(&self, pattern: Option<&str>, default: &str) -> Option<Arc<dyn Implementation>> {
        match pattern {
            Some(pattern) => self.best(pattern),
            None => self.best(default).or_else(|| self.highest()),
        }
    }

    fn best(&self, pattern: &str) -> Option<Arc<dyn Implementation>> {
        self.implementations
            .iter()
            .filter(|i| matches(pattern, i.version()))
            .max_by(|a, b| compare(a.version(), b.version()))
            .cloned()
    }

    fn highest(&self) -> Option<Arc<dyn Implementation>> {
        self.implementations
            .iter()
            .max_by(|a, b| compare(a.version(), b.version()))
            .cloned()
    }
}

impl fmt::Debug for VersionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.versions()).finish()
    }
}

/// `x`, `X` and `*` match any component; a shorter pattern matches any
/// version it is a prefix of.
fn matches(pattern: &str, version: &str) -> bool {
    let version = version.trim_start_matches('v');
    let mut components = version.split('.');

    pattern.trim_start_matches('v').split('.').all(|wanted| match components.next() {
        Some(actual) => matches!(wanted, "x" | "X" | "*") || wanted == actual,
        None => false,
    })
}

fn compare(a: &str, b: &str) -> Ordering {
    let numbers = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|c| c.parse().unwrap_or(0))
            .collect()
    };

    numbers(a).cmp(&numbers(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    fn noop(_: &mut EventLoop) -> ScriptResult {
        Ok(())
    }

    impl Implementation for Fixed {
        fn version(&self) -> &str {
            self.0
        }

        fn load(&self, _options: &ScriptOptions) -> Result<Box<dyn Script>, SessionError> {
            Ok(Box::new(noop))
        }
    }

    fn registry(versions: &[&'static str]) -> VersionRegistry {
        let mut registry = VersionRegistry::new();
        for version in versions {
            registry.register(Arc::new(Fixed(*version)));
        }
        registry
    }

    #[test]
    fn wildcard_components() {
        assert!(matches("0.10.x", "0.10.48"));
        assert!(matches("0.x", "0.12.1"));
        assert!(matches("0.10", "0.10.3"));
        assert!(matches("v0.10.48", "0.10.48"));
        assert!(!matches("0.10.x", "0.12.0"));
        assert!(!matches("0.10.48.1", "0.10.48"));
    }

    #[test]
    fn selects_highest_match() {
        let registry = registry(&["0.10.2", "0.10.48", "0.12.7", "0.10.9"]);

        let chosen = registry.select(Some("0.10.x"), "0.12.x").unwrap();
        assert_eq!(chosen.version(), "0.10.48");

        let chosen = registry.select(None, "0.12.x").unwrap();
        assert_eq!(chosen.version(), "0.12.7");
    }

    #[test]
    fn default_falls_back_to_highest() {
        let registry = registry(&["0.8.1", "0.12.7"]);

        let chosen = registry.select(None, "0.10.x").unwrap();
        assert_eq!(chosen.version(), "0.12.7");
        assert!(registry.select(Some("4.x"), "0.10.x").is_none());
        assert_eq!(registry.versions(), ["0.12.7", "0.8.1"]);
    }
}
