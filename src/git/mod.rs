//! Git operations: repository command execution, worktree management,
//! the merge protocol and archive-tag cleanup.
//!
//! # Module organization
//!
//! - `repository.rs` - [`Repository`]: the logged command choke point
//! - `parse.rs` - porcelain output parsing
//! - `worktrees.rs` - worktree create/list/cleanup, archive tags
//! - `merge.rs` - the merge protocol with reverse-merge fallback
//! - `error.rs` - [`GitError`]

mod error;
mod merge;
mod parse;
mod repository;
mod worktrees;

pub use error::GitError;
pub use merge::{
    DEFAULT_COMMITTER_EMAIL, DEFAULT_COMMITTER_NAME, MergeOutcome, MergeParams, MergeStrategy,
    merge,
};
pub use repository::Repository;
pub use worktrees::{
    CreateWorktreeParams, WorktreeInfo, cleanup_worktree, create_worktree, list_worktrees,
    worktree_for_branch,
};
