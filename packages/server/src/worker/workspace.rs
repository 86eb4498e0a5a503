//! The scratch workspace: clone-on-first-use and branch detection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::Repository;
use tracing::info;

/// The worker's exclusively owned checkout on the scratch volume.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Make the workspace usable: create the directory, and clone the
    /// configured repository if the volume is still empty.
    pub fn prepare(&self, repository_url: Option<&str>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create workspace {}", self.dir.display()))?;

        let is_empty = self
            .dir
            .read_dir()
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true);

        if let (true, Some(url)) = (is_empty, repository_url) {
            info!(url = %url, dir = %self.dir.display(), "cloning repository into workspace");
            Repository::clone(url, &self.dir)
                .with_context(|| format!("failed to clone {url}"))?;
        }

        Ok(())
    }

    /// The current branch, but only if it has at least one commit.
    ///
    /// A freshly initialized repository has a symbolic HEAD pointing at an
    /// unborn branch; reporting that would produce an Edit button to a
    /// branch the remote cannot resolve.
    pub fn current_branch(&self) -> Option<String> {
        let repo = Repository::open(&self.dir).ok()?;
        let head = repo.head().ok()?;
        head.peel_to_commit().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("workspace-test-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn prepare_creates_missing_directory() {
        let dir = temp_dir("create").join("nested");
        let workspace = Workspace::new(&dir);
        workspace.prepare(None).unwrap();
        assert!(dir.is_dir());
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[test]
    fn branch_is_none_outside_a_repository() {
        let dir = temp_dir("no-repo");
        let workspace = Workspace::new(&dir);
        assert_eq!(workspace.current_branch(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn branch_is_none_before_first_commit() {
        let dir = temp_dir("unborn");
        Repository::init(&dir).unwrap();
        let workspace = Workspace::new(&dir);
        assert_eq!(workspace.current_branch(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn branch_is_reported_once_a_commit_exists() {
        let dir = temp_dir("committed");
        let repo = Repository::init(&dir).unwrap();
        {
            let mut index = repo.index().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let signature = git2::Signature::now("test", "test@example.com").unwrap();
            repo.commit(Some("HEAD"), &signature, &signature, "init", &tree, &[])
                .unwrap();
        }

        let workspace = Workspace::new(&dir);
        let branch = workspace.current_branch().unwrap();
        assert!(branch == "master" || branch == "main");
        std::fs::remove_dir_all(&dir).ok();
    }
}
