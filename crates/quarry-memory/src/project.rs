use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::store::BoxFuture;
use crate::types::{GitInfo, ID_NAMESPACE, ProjectInfo};

/// Resolves a directory to a stable project identity.
pub trait ProjectIdentifier: Send + Sync {
    fn identify(&self, path: &Path) -> BoxFuture<'_, Result<ProjectInfo>>;
}

/// Identifies projects by their workspace root: the nearest ancestor holding
/// `.git`, or the directory itself when there is none.
///
/// The id is a uuid v5 of the case-normalized root plus, for git trees, the
/// `origin` remote and current branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkspaceIdentifier;

impl ProjectIdentifier for WorkspaceIdentifier {
    fn identify(&self, path: &Path) -> BoxFuture<'_, Result<ProjectInfo>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || identify_blocking(&path))
                .await
                .map_err(|e| StoreError::Other(format!("project identification panicked: {e}")))?
        })
    }
}

fn identify_blocking(path: &Path) -> Result<ProjectInfo> {
    let canonical = std::fs::canonicalize(path)?;
    if !canonical.is_dir() {
        return Err(StoreError::Other(format!(
            "{} is not a directory",
            canonical.display()
        )));
    }

    let (root, git) = match find_git_root(&canonical) {
        Some(root) => {
            let git = read_git_info(&root.join(".git"));
            (root, Some(git))
        }
        None => (canonical, None),
    };

    let mut key = normalize_root(&root);
    if let Some(git) = &git {
        key.push('|');
        key.push_str(git.remote.as_deref().unwrap_or(""));
        key.push('|');
        key.push_str(git.branch.as_deref().unwrap_or(""));
    }
    let id = uuid::Uuid::new_v5(&ID_NAMESPACE, format!("project:{key}").as_bytes()).to_string();

    let name = root
        .file_name()
        .map_or_else(|| root.display().to_string(), |n| n.to_string_lossy().into_owned());

    tracing::debug!(%id, root = %root.display(), "identified project");
    Ok(ProjectInfo {
        id,
        name,
        workspace_root: root,
        git,
    })
}

fn normalize_root(root: &Path) -> String {
    let s = root.to_string_lossy().replace('\\', "/").to_lowercase();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() { "/".into() } else { trimmed.into() }
}

fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".git").exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

fn read_git_info(git_dir: &Path) -> GitInfo {
    // Worktrees and submodules use a `.git` file pointing at the real dir.
    let git_dir = if git_dir.is_file() {
        std::fs::read_to_string(git_dir)
            .ok()
            .and_then(|s| s.strip_prefix("gitdir:").map(|p| PathBuf::from(p.trim())))
            .map_or_else(|| git_dir.to_path_buf(), |p| {
                if p.is_absolute() {
                    p
                } else {
                    git_dir.parent().map_or(p.clone(), |parent| parent.join(&p))
                }
            })
    } else {
        git_dir.to_path_buf()
    };

    let branch = std::fs::read_to_string(git_dir.join("HEAD"))
        .ok()
        .and_then(|head| parse_head(&head));
    let remote = std::fs::read_to_string(git_dir.join("config"))
        .ok()
        .and_then(|cfg| parse_origin_url(&cfg));
    GitInfo { remote, branch }
}

fn parse_head(head: &str) -> Option<String> {
    head.trim()
        .strip_prefix("ref: refs/heads/")
        .map(str::to_owned)
}

fn parse_origin_url(config: &str) -> Option<String> {
    let mut in_origin = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == "[remote \"origin\"]";
            continue;
        }
        if in_origin
            && let Some((key, value)) = line.split_once('=')
            && key.trim() == "url"
        {
            return Some(value.trim().to_owned());
        }
    }
    None
}
