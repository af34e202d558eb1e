//! The merge protocol: source branch into target branch, with conflicts
//! returned as structured outcomes and a reverse-merge fallback.
//!
//! Conflicts are *data*, not errors; the orchestrator turns them into a
//! human flow action. The protocol picks the directory where conflict
//! resolution is least disruptive:
//!
//! 1. If a worktree has the target branch checked out, merge there and
//!    leave conflicts in place (`conflict_on_target_branch = true`).
//! 2. Otherwise merge in the main repository; on conflict, abort, restore
//!    the source branch, and merge target *into* source where the user is
//!    already working (`conflict_on_target_branch = false`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::exec::EnvType;

use super::repository::{Repository, command_failed};
use super::worktrees::worktree_for_branch;
use super::GitError;

pub const DEFAULT_COMMITTER_NAME: &str = "Sidekick";
pub const DEFAULT_COMMITTER_EMAIL: &str = "sidekick@side.dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeStrategy {
    Merge,
    Squash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeParams {
    pub source_branch: String,
    pub target_branch: String,
    pub strategy: MergeStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer_email: Option<String>,
}

/// Structured merge outcome. `has_conflicts = true` is a normal result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub has_conflicts: bool,
    /// Directory holding the conflicted checkout, when conflicted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_dir_path: Option<PathBuf>,
    /// Whether the conflicts sit on the target branch's checkout (as
    /// opposed to the reverse-merge fallback into the source).
    pub conflict_on_target_branch: bool,
}

impl MergeOutcome {
    fn clean() -> Self {
        Self {
            has_conflicts: false,
            conflict_dir_path: None,
            conflict_on_target_branch: false,
        }
    }

    fn conflicted(dir: &Path, on_target: bool) -> Self {
        Self {
            has_conflicts: true,
            conflict_dir_path: Some(dir.to_path_buf()),
            conflict_on_target_branch: on_target,
        }
    }
}

/// Merge `source_branch` into `target_branch` per the protocol above.
///
/// `env_type` selects the committer-identity fallback: a `Local`
/// environment borrows the user's `user.name`/`user.email` when the
/// params don't supply one; worktree environments use the Sidekick
/// identity.
pub fn merge(
    repo_dir: &Path,
    env_type: EnvType,
    params: &MergeParams,
) -> Result<MergeOutcome, GitError> {
    let repo = Repository::at(repo_dir);
    if !repo.branch_exists(&params.source_branch)? {
        return Err(GitError::BranchNotFound {
            branch: params.source_branch.clone(),
        });
    }
    if !repo.branch_exists(&params.target_branch)? {
        return Err(GitError::BranchNotFound {
            branch: params.target_branch.clone(),
        });
    }

    let committer = committer_identity(&repo, env_type, params)?;

    // Step 1: a worktree already has the target checked out. Merge in
    // place there and let conflicts rest where the branch lives.
    if let Some(target_wt) = worktree_for_branch(repo_dir, &params.target_branch)? {
        let wt_repo = Repository::at(&target_wt.path);
        return match run_merge(&wt_repo, params, &committer)? {
            MergeRun::Clean => Ok(MergeOutcome::clean()),
            MergeRun::Conflicted => Ok(MergeOutcome::conflicted(&target_wt.path, true)),
        };
    }

    // Step 2: no target worktree. Check the target out in the main
    // repository and merge there.
    let original_branch = repo.current_branch()?;
    repo.run(&["checkout", &params.target_branch])?;
    match run_merge(&repo, params, &committer)? {
        MergeRun::Clean => Ok(MergeOutcome::clean()),
        MergeRun::Conflicted => {
            // Abort so the main repository is never left mid-merge, then
            // put the source branch back in a checkout for the reverse
            // merge. If the source has its own worktree the merge runs
            // there (and the main repo returns to its original branch);
            // otherwise the source is checked out here.
            abort_merge(&repo, params.strategy)?;
            let (reverse_repo, reverse_dir) =
                match worktree_for_branch(repo_dir, &params.source_branch)? {
                    Some(source_wt) => {
                        if let Some(branch) = &original_branch
                            && branch != &params.target_branch
                        {
                            repo.run(&["checkout", branch])?;
                        }
                        (Repository::at(&source_wt.path), source_wt.path)
                    }
                    None => {
                        repo.run(&["checkout", &params.source_branch])?;
                        (repo.clone(), repo_dir.to_path_buf())
                    }
                };

            // Reverse merge: bring target into the source checkout, where
            // the user is already working.
            let reverse = MergeParams {
                source_branch: params.target_branch.clone(),
                target_branch: params.source_branch.clone(),
                strategy: MergeStrategy::Merge,
                commit_message: None,
                committer_name: params.committer_name.clone(),
                committer_email: params.committer_email.clone(),
            };
            match run_merge(&reverse_repo, &reverse, &committer)? {
                MergeRun::Clean => Ok(MergeOutcome::clean()),
                MergeRun::Conflicted => Ok(MergeOutcome::conflicted(&reverse_dir, false)),
            }
        }
    }
}

enum MergeRun {
    Clean,
    Conflicted,
}

/// Run one merge attempt in `repo`'s checkout. The target branch must
/// already be checked out there. Conflicts are detected by unmerged index
/// entries; any other non-zero exit is a real failure.
fn run_merge(
    repo: &Repository,
    params: &MergeParams,
    committer: &CommitterIdentity,
) -> Result<MergeRun, GitError> {
    let env = committer.env();
    match params.strategy {
        MergeStrategy::Merge => {
            let message = params
                .commit_message
                .clone()
                .unwrap_or_else(|| format!("Merge branch '{}'", params.source_branch));
            let args = ["merge", "-m", &message, &params.source_branch];
            let output = repo.git_with_env(&args, &env)?;
            if output.status.success() {
                return Ok(MergeRun::Clean);
            }
            if repo.has_unmerged_paths()? {
                return Ok(MergeRun::Conflicted);
            }
            Err(command_failed(&args, &output))
        }
        MergeStrategy::Squash => {
            let args = ["merge", "--squash", &params.source_branch];
            let output = repo.git_with_env(&args, &env)?;
            if !output.status.success() {
                if repo.has_unmerged_paths()? {
                    return Ok(MergeRun::Conflicted);
                }
                return Err(command_failed(&args, &output));
            }
            // Clean squash stages everything; commit the staged index.
            let message = params
                .commit_message
                .clone()
                .unwrap_or_else(|| format!("Squash merge branch '{}'", params.source_branch));
            let commit_args = ["commit", "-m", &message];
            let output = repo.git_with_env(&commit_args, &env)?;
            if !output.status.success() {
                return Err(command_failed(&commit_args, &output));
            }
            Ok(MergeRun::Clean)
        }
    }
}

/// Restore a clean checkout after a conflicted attempt. A plain merge
/// leaves `MERGE_HEAD` and supports `merge --abort`; a conflicted squash
/// has no merge in progress, so `reset --merge` does the restore.
fn abort_merge(repo: &Repository, strategy: MergeStrategy) -> Result<(), GitError> {
    match strategy {
        MergeStrategy::Merge => repo.run(&["merge", "--abort"])?,
        MergeStrategy::Squash => repo.run(&["reset", "--merge"])?,
    };
    Ok(())
}

struct CommitterIdentity {
    name: String,
    email: String,
}

impl CommitterIdentity {
    fn env(&self) -> Vec<(&str, &str)> {
        vec![
            ("GIT_AUTHOR_NAME", self.name.as_str()),
            ("GIT_AUTHOR_EMAIL", self.email.as_str()),
            ("GIT_COMMITTER_NAME", self.name.as_str()),
            ("GIT_COMMITTER_EMAIL", self.email.as_str()),
        ]
    }
}

fn committer_identity(
    repo: &Repository,
    env_type: EnvType,
    params: &MergeParams,
) -> Result<CommitterIdentity, GitError> {
    if let (Some(name), Some(email)) = (&params.committer_name, &params.committer_email) {
        return Ok(CommitterIdentity {
            name: name.clone(),
            email: email.clone(),
        });
    }
    // In a Local environment the merge commit should read as the user's
    // own, when their identity is configured.
    if env_type == EnvType::Local
        && let (Some(name), Some(email)) =
            (repo.config_value("user.name")?, repo.config_value("user.email")?)
    {
        return Ok(CommitterIdentity { name, email });
    }
    Ok(CommitterIdentity {
        name: params
            .committer_name
            .clone()
            .unwrap_or_else(|| DEFAULT_COMMITTER_NAME.to_string()),
        email: params
            .committer_email
            .clone()
            .unwrap_or_else(|| DEFAULT_COMMITTER_EMAIL.to_string()),
    })
}
