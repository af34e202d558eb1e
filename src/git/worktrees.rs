//! Worktree creation, listing and cleanup.
//!
//! Every flow that executes code gets its own worktree under
//! `<baseDir>/worktrees/<workspaceId>/<repoName>-<branchSuffix>`. Cleanup
//! preserves the branch tip as an `archive/<branch>` tag before the
//! branch is force-deleted, so no work is ever unreachable.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::exec::{CommandInput, ExecEnvironment};
use crate::model;

use super::parse::WorktreeEntry;
use super::repository::Repository;
use super::GitError;

/// A worktree as reported by git: resolved path plus branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

/// List a repository's worktrees. Bare and detached entries are
/// excluded; paths are symlink-resolved.
pub fn list_worktrees(repo_dir: &Path) -> Result<Vec<WorktreeInfo>, GitError> {
    let repo = Repository::at(repo_dir);
    let stdout = repo.run(&["worktree", "list", "--porcelain"])?;
    let entries = WorktreeEntry::parse_porcelain_list(&stdout)?;
    Ok(entries
        .into_iter()
        .filter(|wt| !wt.bare && !wt.detached)
        .filter_map(|wt| {
            let branch = wt.branch?;
            let path = dunce::canonicalize(&wt.path).unwrap_or(wt.path);
            Some(WorktreeInfo { path, branch })
        })
        .collect())
}

/// Find the worktree checked out on `branch`, if any.
pub fn worktree_for_branch(
    repo_dir: &Path,
    branch: &str,
) -> Result<Option<WorktreeInfo>, GitError> {
    Ok(list_worktrees(repo_dir)?
        .into_iter()
        .find(|wt| wt.branch == branch))
}

/// Parameters for creating a worktree.
#[derive(Debug, Clone)]
pub struct CreateWorktreeParams {
    pub repo_dir: PathBuf,
    /// Branch to start from; defaults to HEAD.
    pub start_branch: Option<String>,
    /// Base directory for worktree placement; defaults to
    /// `SIDE_DATA_HOME`.
    pub worktree_base_dir: Option<PathBuf>,
}

/// Create the worktree for a flow: a new branch named after the worktree,
/// checked out at `<baseDir>/worktrees/<workspaceId>/<repoName>-<suffix>`.
///
/// Fails with [`GitError::BranchAlreadyExists`] when the branch exists:
/// branch names are the per-workspace uniqueness handle for flows, so
/// this is a precondition failure, not something to retry.
pub fn create_worktree(
    params: &CreateWorktreeParams,
    worktree: &model::Worktree,
) -> Result<PathBuf, GitError> {
    let repo = Repository::at(&params.repo_dir);
    if repo.branch_exists(&worktree.name)? {
        return Err(GitError::BranchAlreadyExists {
            branch: worktree.name.clone(),
        });
    }

    let base_dir = match &params.worktree_base_dir {
        Some(dir) => dir.clone(),
        None => crate::config::SidekickConfig::from_env()
            .map_err(|e| GitError::ParseError(e.to_string()))?
            .data_home,
    };
    let repo_name = params
        .repo_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GitError::WorktreePath {
            path: params.repo_dir.clone(),
            message: "repository path has no name component".to_string(),
        })?;
    // Branch names may be namespaced (side/feature-x); only the last
    // segment lands in the directory name.
    let branch_suffix = worktree.name.rsplit('/').next().unwrap_or(&worktree.name);
    let worktree_path = base_dir
        .join("worktrees")
        .join(&worktree.workspace_id)
        .join(format!("{repo_name}-{branch_suffix}"));

    if worktree_path.exists() {
        return Err(GitError::WorktreePath {
            path: worktree_path,
            message: "worktree directory already exists".to_string(),
        });
    }
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let path_str = worktree_path.to_str().ok_or_else(|| GitError::WorktreePath {
        path: worktree_path.clone(),
        message: "worktree path contains invalid UTF-8".to_string(),
    })?;
    let mut args = vec!["worktree", "add", path_str, "-b", &worktree.name];
    if let Some(start) = &params.start_branch {
        args.push(start);
    }
    repo.run(&args)?;

    Ok(dunce::canonicalize(&worktree_path).unwrap_or(worktree_path))
}

/// Tear down a flow's worktree once its branch has been merged (or
/// abandoned): detach HEAD, tag the tip as `archive/<branch>` (suffix
/// `-N` on collision), force-delete the branch, remove the worktree.
///
/// Runs the in-worktree steps through the flow's execution environment so
/// they show up in the flow's command log like everything else.
pub async fn cleanup_worktree(
    env: &ExecEnvironment,
    worktree_path: &Path,
    branch_name: &str,
    archive_message: &str,
) -> anyhow::Result<()> {
    let run = |args: Vec<String>| {
        let input = CommandInput {
            relative_working_dir: String::new(),
            command: "git".to_string(),
            args,
            env_vars: Default::default(),
        };
        async move {
            let out = env.run_command(&input).await?;
            if !out.success() {
                anyhow::bail!(
                    "'git {}' failed in {}: {}",
                    input.args.join(" "),
                    worktree_path.display(),
                    out.stderr.trim()
                );
            }
            Ok::<_, anyhow::Error>(out)
        }
    };

    let head = run(vec!["rev-parse".into(), "HEAD".into()]).await?;
    let sha = head.stdout.trim().to_string();

    // Detach so the branch is no longer checked out anywhere and can be
    // deleted out from under the worktree.
    run(vec!["checkout".into(), "--detach".into(), sha.clone()]).await?;

    let repo = Repository::at(worktree_path);
    let existing = repo.list_tags(&format!("archive/{branch_name}*"))?;
    let tag = next_archive_tag(&existing, branch_name);
    run(vec![
        "tag".into(),
        "-a".into(),
        tag.clone(),
        "-m".into(),
        archive_message.to_string(),
        sha,
    ])
    .await?;
    log::info!("archived branch '{branch_name}' as {tag}");

    run(vec!["branch".into(), "-D".into(), branch_name.to_string()]).await?;

    // `git worktree remove` refuses to run from inside the worktree being
    // removed, so find the main repository and run it there.
    let common_dir = run(vec!["rev-parse".into(), "--git-common-dir".into()]).await?;
    let common_dir = PathBuf::from(common_dir.stdout.trim());
    let main_repo_dir = common_dir
        .parent()
        .context("git common dir has no parent")?
        .to_path_buf();
    let worktree_arg = worktree_path
        .to_str()
        .context("worktree path contains invalid UTF-8")?;
    Repository::at(&main_repo_dir)
        .run(&["worktree", "remove", "--force", worktree_arg])
        .with_context(|| format!("removing worktree {}", worktree_path.display()))?;

    Ok(())
}

/// The archive-tag namespace is monotone: existing tags are never
/// rewritten. On collision with the base name, pick the smallest `N ≥ 2`
/// making `archive/<branch>-N` free.
pub(crate) fn next_archive_tag(existing: &[String], branch: &str) -> String {
    let base = format!("archive/{branch}");
    if !existing.iter().any(|t| t == &base) {
        return base;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !existing.iter().any(|t| t == &candidate) {
            return candidate;
        }
        n += 1;
    }
}
