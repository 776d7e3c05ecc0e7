use std::path::{Path, PathBuf};

/// Maps script-visible paths onto host paths.
///
/// Script paths are always `/`-separated. A relative path is resolved
/// against the virtual working directory, then normalized lexically.
/// The result goes through the mount table (longest prefix wins) and,
/// failing that, is placed under the root. Without a root the normalized
/// path is used as-is on the host.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: Option<PathBuf>,
    mounts: Vec<(String, PathBuf)>,
    working_dir: String,
}

impl PathTranslator {
    /// A translator with no root and no mounts, working in `working_dir`.
    pub fn new(working_dir: impl Into<String>) -> Self {
        Self {
            root: None,
            mounts: Vec::new(),
            working_dir: working_dir.into(),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Maps the script-visible `prefix` onto the host directory `dir`.
    pub fn with_mount(mut self, prefix: &str, dir: impl Into<PathBuf>) -> Self {
        let prefix = normalize("/", prefix).unwrap_or_else(|| "/".to_string());
        self.mounts.push((prefix, dir.into()));
        self
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn set_working_dir(&mut self, working_dir: impl Into<String>) {
        self.working_dir = working_dir.into();
    }

    /// The absolute, normalized script path for `path`.
    ///
    /// `None` if the path climbs above `/`.
    pub fn normalize(&self, path: &str) -> Option<String> {
        normalize(&self.working_dir, path)
    }

    /// The host path for `path`, or `None` if it escapes the sandbox.
    pub fn translate(&self, path: &str) -> Option<PathBuf> {
        let normalized = self.normalize(path)?;

        let mount = self
            .mounts
            .iter()
            .filter(|(prefix, _)| is_prefix(prefix, &normalized))
            .max_by_key(|(prefix, _)| prefix.len());

        if let Some((prefix, dir)) = mount {
            return Some(join(dir, &normalized[prefix.len()..]));
        }

        match &self.root {
            Some(root) => Some(join(root, &normalized)),
            None => Some(PathBuf::from(normalized)),
        }
    }
}

fn is_prefix(prefix: &str, path: &str) -> bool {
    prefix == "/"
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

fn join(base: &Path, rest: &str) -> PathBuf {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        base.to_path_buf()
    } else {
        base.join(rest)
    }
}

fn normalize(working_dir: &str, path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();

    let relative = !path.starts_with('/');
    let sources = if relative {
        [working_dir, path]
    } else {
        ["", path]
    };

    for segment in sources.iter().flat_map(|s| s.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            name => parts.push(name),
        }
    }

    Some(format!("/{}", parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_against_working_dir() {
        let translator = PathTranslator::new("/home/user");

        assert_eq!(translator.normalize("a/./b/../c").as_deref(), Some("/home/user/a/c"));
        assert_eq!(translator.normalize("/etc//hosts").as_deref(), Some("/etc/hosts"));
        assert_eq!(translator.normalize("..").as_deref(), Some("/home"));
    }

    #[test]
    fn climbing_above_the_top_is_rejected() {
        let translator = PathTranslator::new("/").with_root("/srv/sandbox");

        assert!(translator.translate("/../etc/passwd").is_none());
        assert!(translator.translate("../x").is_none());
    }

    #[test]
    fn root_and_mounts() {
        let translator = PathTranslator::new("/")
            .with_root("/srv/root")
            .with_mount("/data", "/mnt/data")
            .with_mount("/data/cache", "/mnt/cache");

        assert_eq!(translator.translate("/tmp/x"), Some(PathBuf::from("/srv/root/tmp/x")));
        assert_eq!(translator.translate("/data/a.txt"), Some(PathBuf::from("/mnt/data/a.txt")));
        assert_eq!(translator.translate("/data/cache/k"), Some(PathBuf::from("/mnt/cache/k")));
        assert_eq!(translator.translate("/data"), Some(PathBuf::from("/mnt/data")));
        assert_eq!(translator.translate("/database"), Some(PathBuf::from("/srv/root/database")));
    }

    #[test]
    fn no_root_is_passthrough() {
        let translator = PathTranslator::new("/work");
        assert_eq!(translator.translate("out.log"), Some(PathBuf::from("/work/out.log")));
    }
}
