//! Ignore predicate applied to discovered files and raw watch events.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{IndexError, Result};
use crate::languages::is_indexable;

const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".idea",
    ".vscode",
    ".venv",
    "venv",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".tox",
    "node_modules",
    "bower_components",
    "target",
    "dist",
    "build",
    "out",
    ".next",
    ".nuxt",
    "coverage",
    "vendor",
];

const IGNORED_SUFFIXES: &[&str] = &[
    ".min.js",
    ".min.css",
    ".map",
    ".lock",
    ".log",
    ".pyc",
    ".class",
    ".o",
    ".so",
    ".dll",
    ".exe",
];

/// Single predicate deciding whether a path takes part in indexing.
///
/// Combines a built-in denylist with optional gitignore-syntax patterns
/// anchored at the project root. Evaluation touches only the path, never the
/// file contents.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    root: std::path::PathBuf,
    patterns: Gitignore,
}

impl IgnoreRules {
    /// # Errors
    ///
    /// Returns [`IndexError::Discovery`] if a pattern is not valid gitignore syntax.
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| IndexError::Discovery(format!("ignore pattern {pattern:?}: {e}")))?;
        }
        let patterns = builder
            .build()
            .map_err(|e| IndexError::Discovery(format!("ignore patterns: {e}")))?;
        Ok(Self {
            root: root.to_path_buf(),
            patterns,
        })
    }

    /// Rules with only the built-in denylist.
    #[must_use]
    pub fn builtin(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            patterns: Gitignore::empty(),
        }
    }

    #[must_use]
    pub fn is_ignored(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);

        let in_ignored_dir = rel.parent().is_some_and(|parent| {
            parent.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .is_some_and(|name| IGNORED_DIRS.contains(&name))
            })
        });
        if in_ignored_dir {
            return true;
        }

        let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
            return true;
        };
        let lower = name.to_ascii_lowercase();
        if IGNORED_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            return true;
        }

        // Patterns are root-anchored; paths outside the root only see the denylist.
        !rel.has_root()
            && self
                .patterns
                .matched_path_or_any_parents(rel, false)
                .is_ignore()
    }

    /// Not ignored and of a language the indexer understands.
    #[must_use]
    pub fn accepts(&self, path: &Path) -> bool {
        !self.is_ignored(path) && is_indexable(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_dirs_are_ignored() {
        let rules = IgnoreRules::builtin(Path::new("/repo"));
        assert!(rules.is_ignored(Path::new("/repo/node_modules/x/index.js")));
        assert!(rules.is_ignored(Path::new("/repo/target/debug/build.rs")));
        assert!(rules.is_ignored(Path::new("/repo/.git/HEAD")));
        assert!(!rules.is_ignored(Path::new("/repo/src/main.rs")));
    }

    #[test]
    fn builtin_suffixes_are_ignored() {
        let rules = IgnoreRules::builtin(Path::new("/repo"));
        assert!(rules.is_ignored(Path::new("/repo/web/app.min.js")));
        assert!(rules.is_ignored(Path::new("/repo/Cargo.lock")));
        assert!(!rules.is_ignored(Path::new("/repo/web/app.js")));
    }

    #[test]
    fn user_patterns_apply() {
        let rules = IgnoreRules::new(
            Path::new("/repo"),
            &["generated/".to_owned(), "*.pb.go".to_owned()],
        )
        .unwrap();
        assert!(rules.is_ignored(Path::new("/repo/generated/api.rs")));
        assert!(rules.is_ignored(Path::new("/repo/proto/user.pb.go")));
        assert!(!rules.is_ignored(Path::new("/repo/proto/user.go")));
    }

    #[test]
    fn accepts_requires_known_language() {
        let rules = IgnoreRules::builtin(Path::new("/repo"));
        assert!(rules.accepts(Path::new("/repo/src/lib.rs")));
        assert!(!rules.accepts(Path::new("/repo/assets/logo.png")));
    }
}
