// Helper functions are shared across several integration-test crates;
// not every crate uses every helper.
#![allow(dead_code)]

//! Test utilities: throwaway git repositories in temp directories with
//! deterministic identity and no dependence on user-level git config.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

pub struct TestRepo {
    // Held for cleanup on drop.
    _dir: TempDir,
    path: PathBuf,
}

impl TestRepo {
    /// A fresh repository on branch `main` with one initial commit.
    pub fn new() -> Self {
        let dir = TempDir::with_prefix("sidekick-test-").expect("creating temp dir");
        // Canonicalize up front so comparisons survive macOS /var symlinks.
        let path = dunce::canonicalize(dir.path()).expect("canonicalizing temp dir");
        let repo = Self { _dir: dir, path };
        repo.git(&["init", "-b", "main"]);
        repo.git(&["config", "user.name", "Test User"]);
        repo.git(&["config", "user.email", "test@example.com"]);
        repo.write("README.md", "# test repo\n");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "initial commit"]);
        repo
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run git in the repo root, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        self.git_in(&self.path, args)
    }

    /// Run git in an arbitrary directory (e.g. a worktree).
    pub fn git_in(&self, dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_DATE", "2024-01-01T12:00:00+00:00")
            .env("GIT_COMMITTER_DATE", "2024-01-01T12:00:00+00:00")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_CONFIG_SYSTEM", "/dev/null")
            .output()
            .expect("running git");
        assert!(
            output.status.success(),
            "git {:?} failed in {}:\n{}{}",
            args,
            dir.display(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    /// Like [`git_in`](Self::git_in) but tolerating failure; returns
    /// (success, combined output).
    pub fn try_git_in(&self, dir: &Path, args: &[&str]) -> (bool, String) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("running git");
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        (output.status.success(), combined)
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.path.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("creating parent dirs");
        }
        std::fs::write(path, content).expect("writing file");
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "."]);
        self.git(&["commit", "-m", message]);
    }

    /// Create a branch at the current HEAD without switching to it.
    pub fn branch(&self, name: &str) {
        self.git(&["branch", name]);
    }

    pub fn current_branch(&self) -> String {
        self.git(&["symbolic-ref", "--short", "HEAD"]).trim().to_string()
    }

    pub fn tags(&self) -> Vec<String> {
        self.git(&["tag", "--list"])
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// A separate base directory for worktree placement, standing in for
/// `SIDE_DATA_HOME`.
pub fn worktree_base() -> (TempDir, PathBuf) {
    let dir = TempDir::with_prefix("sidekick-data-").expect("creating data dir");
    let path = dunce::canonicalize(dir.path()).expect("canonicalizing data dir");
    (dir, path)
}
