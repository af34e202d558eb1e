//! Git error types.

use std::path::PathBuf;

/// Errors from git operations.
///
/// Merge conflicts are deliberately *not* represented here; a conflict is
/// a structured outcome ([`super::MergeOutcome`]), not an error. These
/// variants cover preconditions and genuine command failures.
#[derive(Debug)]
pub enum GitError {
    /// A git command exited non-zero in a context where that means the
    /// operation failed. Carries the command and its combined output.
    CommandFailed { command: String, output: String },
    /// Git output we couldn't make sense of.
    ParseError(String),
    /// Branch already exists (when trying to create). Non-retryable
    /// precondition failure.
    BranchAlreadyExists { branch: String },
    /// Branch is missing where one was required.
    BranchNotFound { branch: String },
    /// Worktree path problems (exists already, missing, not UTF-8).
    WorktreePath { path: PathBuf, message: String },
    /// Spawn/IO failure running git itself.
    Io(std::io::Error),
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::CommandFailed { command, output } => {
                if output.is_empty() {
                    write!(f, "'{command}' failed")
                } else {
                    write!(f, "'{command}' failed:\n{output}")
                }
            }
            GitError::ParseError(msg) => write!(f, "failed to parse git output: {msg}"),
            GitError::BranchAlreadyExists { branch } => {
                write!(f, "branch '{branch}' already exists")
            }
            GitError::BranchNotFound { branch } => write!(f, "branch '{branch}' not found"),
            GitError::WorktreePath { path, message } => {
                write!(f, "{message}: {}", path.display())
            }
            GitError::Io(e) => write!(f, "git io error: {e}"),
        }
    }
}

impl std::error::Error for GitError {}

impl From<std::io::Error> for GitError {
    fn from(e: std::io::Error) -> Self {
        GitError::Io(e)
    }
}

impl GitError {
    /// Whether this is a caller mistake rather than an environment
    /// failure; precondition violations are non-retryable.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            GitError::BranchAlreadyExists { .. }
                | GitError::BranchNotFound { .. }
                | GitError::WorktreePath { .. }
        )
    }
}
