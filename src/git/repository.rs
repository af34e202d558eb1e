//! Repository: git command execution rooted at one directory.
//!
//! Every git invocation in the crate funnels through [`Repository::git`]
//! so command, duration and exit status all show up in debug logs.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Instant;

use super::GitError;

/// A git repository (or worktree) rooted at a directory.
#[derive(Debug, Clone)]
pub struct Repository {
    dir: PathBuf,
}

impl Repository {
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run git with the given args and extra environment variables,
    /// returning the raw output. Only spawn failures error here; callers
    /// interpret the exit status.
    pub(crate) fn git_with_env(
        &self,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<Output, GitError> {
        let cmd_str = format!("git {}", args.join(" "));
        log::debug!("$ {} [{}]", cmd_str, self.dir.display());
        let t0 = Instant::now();

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.dir)
            .env("GIT_EDITOR", "true")
            .stdin(Stdio::null());
        for (key, value) in env {
            cmd.env(key, value);
        }
        let output = cmd.output()?;

        log::debug!(
            "[side-trace] cmd=\"{}\" dur={:.1}ms ok={}",
            cmd_str,
            t0.elapsed().as_secs_f64() * 1000.0,
            output.status.success()
        );
        Ok(output)
    }

    pub(crate) fn git(&self, args: &[&str]) -> Result<Output, GitError> {
        self.git_with_env(args, &[])
    }

    /// Run a git command, treating a non-zero exit as [`GitError::CommandFailed`].
    /// Returns stdout.
    pub fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.git(args)?;
        if !output.status.success() {
            return Err(command_failed(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a git command where the exit code is a boolean answer
    /// (e.g. `merge-base --is-ancestor`, `rev-parse --verify`).
    pub fn run_check(&self, args: &[&str]) -> Result<bool, GitError> {
        Ok(self.git(args)?.status.success())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        self.run_check(&[
            "rev-parse",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])
    }

    /// The current branch, or `None` for detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>, GitError> {
        let output = self.git(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    pub fn head_sha(&self) -> Result<String, GitError> {
        Ok(self.run(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// The repository's default branch.
    ///
    /// Prefers the `origin/HEAD` symbolic ref, then a local `main`, then
    /// `master`.
    pub fn default_branch(&self) -> Result<String, GitError> {
        let output = self.git(&["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"])?;
        if output.status.success() {
            let full = String::from_utf8_lossy(&output.stdout);
            let name = full.trim();
            let branch = name.strip_prefix("origin/").unwrap_or(name);
            if !branch.is_empty() {
                return Ok(branch.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate)? {
                return Ok(candidate.to_string());
            }
        }
        Err(GitError::BranchNotFound {
            branch: "main".to_string(),
        })
    }

    /// Tags matching the pattern, one per line of `git tag --list`.
    pub fn list_tags(&self, pattern: &str) -> Result<Vec<String>, GitError> {
        Ok(self
            .run(&["tag", "--list", pattern])?
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Whether the index/worktree has unmerged (conflicted) paths.
    pub fn has_unmerged_paths(&self) -> Result<bool, GitError> {
        Ok(!self.run(&["ls-files", "--unmerged"])?.trim().is_empty())
    }

    /// Read a config value, `None` when unset.
    pub fn config_value(&self, key: &str) -> Result<Option<String>, GitError> {
        let output = self.git(&["config", "--get", key])?;
        if !output.status.success() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    }
}

pub(crate) fn command_failed(args: &[&str], output: &Output) -> GitError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    // Some git commands print errors to stdout (e.g. `commit` with nothing
    // to commit), so keep both streams.
    let combined = [stderr.trim(), stdout.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    GitError::CommandFailed {
        command: format!("git {}", args.join(" ")),
        output: combined,
    }
}
