//! The shipped flows: `basic_dev` and `planned_dev`.
//!
//! Both drive one task end to end: create an isolated worktree, run the
//! dev steps (commands gated by the shell-command extractor, file
//! validity checks), hold for human merge approval, merge back to the
//! target branch, and clean up with an archive tag. `planned_dev`
//! prepends a planning phase that waits for plan approval.
//!
//! Flow code here is replayable: every effect goes through the
//! [`FlowCtx`] recording APIs, and everything else is a pure function of
//! the recorded values.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::exec::{CommandInput, CommandOutput, ExecEnvironment};
use crate::git::{self, CreateWorktreeParams, MergeOutcome, MergeParams, MergeStrategy};
use crate::model::{
    ActionStatus, FlowAction, FlowStatus, SubflowStatus, Task, Workspace, Worktree,
};
use crate::shellparse::extract_commands;
use crate::validity::{FileValidity, check_file_validity};

use super::runtime::{ActivityError, ActivityOptions, FlowCtx, FlowError};

/// Heartbeat window for command-running activities. The command runner
/// beats every 5 s, comfortably inside half this window.
const COMMAND_HEARTBEAT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(40);

/// Everything a dev flow needs to run, persisted at start for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInput {
    pub repo_dir: PathBuf,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_base_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
    #[serde(default = "default_strategy")]
    pub merge_strategy: MergeStrategy,
    /// Shell commands executed as the dev steps, in order.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Files validated (C3 gate) after the dev steps.
    #[serde(default)]
    pub check_files: Vec<String>,
}

fn default_strategy() -> MergeStrategy {
    MergeStrategy::Merge
}

impl FlowInput {
    /// Build a flow input from a task's `flowOptions`.
    pub fn from_task(workspace: &Workspace, task: &Task) -> Self {
        let opts = &task.flow_options;
        let str_opt = |key: &str| {
            opts.get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let list_opt = |key: &str| -> Vec<String> {
            opts.get(key)
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        let merge_strategy = match str_opt("mergeStrategy").as_deref() {
            Some("squash") => MergeStrategy::Squash,
            _ => MergeStrategy::Merge,
        };
        Self {
            repo_dir: PathBuf::from(&workspace.local_repo_dir),
            description: task.description.clone(),
            worktree_base_dir: str_opt("worktreeBaseDir").map(PathBuf::from),
            start_branch: str_opt("startBranch"),
            target_branch: str_opt("targetBranch"),
            merge_strategy,
            commands: list_opt("commands"),
            check_files: list_opt("checkFiles"),
        }
    }
}

/// Branch name for a flow's worktree: deterministic from the flow id, so
/// replay recreates the same name without a side effect.
fn branch_name_for_flow(flow_id: &str) -> String {
    let suffix = flow_id.rsplit('_').next().unwrap_or(flow_id);
    let tail: String = suffix
        .chars()
        .rev()
        .take(10)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("side/task-{}", tail.to_lowercase())
}

pub async fn basic_dev(ctx: &FlowCtx, input: &FlowInput) -> Result<(), FlowError> {
    ctx.set_flow_status(FlowStatus::InProgress)?;
    run_dev(ctx, input).await
}

pub async fn planned_dev(ctx: &FlowCtx, input: &FlowInput) -> Result<(), FlowError> {
    ctx.set_flow_status(FlowStatus::InProgress)?;

    let subflow = ctx.open_subflow("plan")?;
    let mut action = FlowAction::new(ctx.workspace_id(), ctx.flow_id(), "plan_approval");
    action.is_human_action = true;
    action
        .action_params
        .insert("description".into(), json!(input.description));
    let action = ctx.record_action(action)?;
    let response = ctx.await_human_response(&action.id).await?;
    let approved = response.approved.unwrap_or(false);
    ctx.close_subflow(
        &subflow,
        if approved {
            SubflowStatus::Complete
        } else {
            SubflowStatus::Failed
        },
        Some(json!({ "approved": approved })),
    )?;
    if !approved {
        return Err(FlowError::StepFailed {
            message: "plan rejected by user".to_string(),
        });
    }

    run_dev(ctx, input).await
}

/// The shared dev pipeline: setup → dev steps → review → merge → cleanup.
async fn run_dev(ctx: &FlowCtx, input: &FlowInput) -> Result<(), FlowError> {
    let (env, worktree) = setup_worktree(ctx, input).await?;
    let target_branch = resolve_target_branch(ctx, input).await?;

    run_dev_steps(ctx, input, &env).await?;

    let approved = request_merge_approval(ctx, &worktree, &target_branch).await?;
    if !approved {
        cleanup(ctx, &env, &worktree).await?;
        return Err(FlowError::StepFailed {
            message: "merge rejected by user".to_string(),
        });
    }

    merge_to_target(ctx, input, &worktree, &target_branch).await?;
    cleanup(ctx, &env, &worktree).await?;
    Ok(())
}

async fn setup_worktree(
    ctx: &FlowCtx,
    input: &FlowInput,
) -> Result<(ExecEnvironment, Worktree), FlowError> {
    let subflow = ctx.open_subflow("setup")?;

    let branch = branch_name_for_flow(ctx.flow_id());
    let mut action = FlowAction::new(ctx.workspace_id(), ctx.flow_id(), "create_worktree");
    action.action_params.insert("branch".into(), json!(branch));
    let action = ctx.record_action(action)?;
    ctx.update_action(&action.id, ActionStatus::Started, None)?;

    let seed = Worktree {
        id: ctx.new_id("wt")?,
        workspace_id: ctx.workspace_id().to_string(),
        flow_id: Some(ctx.flow_id().to_string()),
        name: branch.clone(),
        path: String::new(),
        created: Utc::now(),
    };
    let params = CreateWorktreeParams {
        repo_dir: input.repo_dir.clone(),
        start_branch: input.start_branch.clone(),
        worktree_base_dir: input.worktree_base_dir.clone(),
    };
    let db = ctx.db().clone();
    let worktree: Worktree = ctx
        .activity("create_worktree", ActivityOptions::default_policy(), move |_actx| {
            let params = params.clone();
            let seed = seed.clone();
            let db = db.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let path = git::create_worktree(&params, &seed).map_err(|e| {
                        if e.is_precondition() {
                            ActivityError::non_retryable(e)
                        } else {
                            ActivityError::retryable(e)
                        }
                    })?;
                    let record = Worktree {
                        path: path.display().to_string(),
                        created: Utc::now(),
                        ..seed
                    };
                    db.put_worktree(&record).map_err(ActivityError::retryable)?;
                    Ok(record)
                })
                .await
                .map_err(|e| ActivityError::retryable(anyhow::anyhow!(e)))?
            }
        })
        .await?;

    ctx.update_action(
        &action.id,
        ActionStatus::Complete,
        Some(worktree.path.clone()),
    )?;
    ctx.close_subflow(&subflow, SubflowStatus::Complete, None)?;

    // Built directly (not via the checked constructor): the recorded
    // path is already canonical, and replay must not depend on the
    // directory still existing.
    let env = ExecEnvironment::LocalGitWorktree {
        working_directory: PathBuf::from(&worktree.path),
        branch,
    };
    Ok((env, worktree))
}

async fn resolve_target_branch(ctx: &FlowCtx, input: &FlowInput) -> Result<String, FlowError> {
    if let Some(target) = &input.target_branch {
        return Ok(target.clone());
    }
    let repo_dir = input.repo_dir.clone();
    ctx.activity(
        "resolve_target_branch",
        ActivityOptions::single_retry(),
        move |_actx| {
            let repo_dir = repo_dir.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    git::Repository::at(&repo_dir)
                        .default_branch()
                        .map_err(ActivityError::non_retryable)
                })
                .await
                .map_err(|e| ActivityError::retryable(anyhow::anyhow!(e)))?
            }
        },
    )
    .await
}

async fn run_dev_steps(
    ctx: &FlowCtx,
    input: &FlowInput,
    env: &ExecEnvironment,
) -> Result<(), FlowError> {
    if input.commands.is_empty() && input.check_files.is_empty() {
        return Ok(());
    }
    let subflow = ctx.open_subflow("dev")?;

    for command in &input.commands {
        // Permission gate: what would this script actually execute? The
        // extraction is pure, so it can run in flow code; the result is
        // recorded on the action for the UI.
        let expanded = extract_commands(command).unwrap_or_default();
        let mut action = FlowAction::new(ctx.workspace_id(), ctx.flow_id(), "run_command");
        action.action_params.insert("command".into(), json!(command));
        action
            .action_params
            .insert("executedCommands".into(), json!(expanded));
        let action = ctx.record_action(action)?;
        ctx.update_action(&action.id, ActionStatus::Started, None)?;

        let env = env.clone();
        let command_line = command.clone();
        let output: CommandOutput = ctx
            .activity(
                "run_command",
                ActivityOptions::default_policy().with_heartbeat(COMMAND_HEARTBEAT_TIMEOUT),
                move |actx| {
                    let env = env.clone();
                    let command_line = command_line.clone();
                    async move {
                        let input = CommandInput::new("sh", ["-c", command_line.as_str()]);
                        let heartbeat = actx.heartbeat_fn();
                        env.run_command_with_heartbeat(&input, heartbeat.as_ref(), &actx.cancel)
                            .await
                            .map_err(ActivityError::retryable)
                    }
                },
            )
            .await?;

        let summary = json!({
            "exitStatus": output.exit_status,
            "stdout": tail(&output.stdout),
            "stderr": tail(&output.stderr),
        })
        .to_string();
        ctx.update_action(&action.id, ActionStatus::Complete, Some(summary))?;

        // Exit status is data, and for a dev step that data means the
        // step failed.
        if !output.success() {
            ctx.close_subflow(
                &subflow,
                SubflowStatus::Failed,
                Some(json!({ "command": command, "exitStatus": output.exit_status })),
            )?;
            return Err(FlowError::StepFailed {
                message: format!("command '{command}' exited with status {}", output.exit_status),
            });
        }
    }

    for file in &input.check_files {
        let mut action = FlowAction::new(ctx.workspace_id(), ctx.flow_id(), "check_file_validity");
        action.action_params.insert("path".into(), json!(file));
        let action = ctx.record_action(action)?;
        ctx.update_action(&action.id, ActionStatus::Started, None)?;

        let env = env.clone();
        let path = file.clone();
        let verdict: FileValidity = ctx
            .activity(
                "check_file_validity",
                ActivityOptions::default_policy(),
                move |_actx| {
                    let env = env.clone();
                    let path = path.clone();
                    async move {
                        check_file_validity(&env, &path)
                            .await
                            .map_err(ActivityError::retryable)
                    }
                },
            )
            .await?;

        ctx.update_action(
            &action.id,
            ActionStatus::Complete,
            Some(serde_json::to_string(&verdict)?),
        )?;
        if !verdict.valid {
            ctx.close_subflow(
                &subflow,
                SubflowStatus::Failed,
                Some(json!({ "path": file, "message": verdict.message })),
            )?;
            return Err(FlowError::StepFailed {
                message: format!("file '{file}' failed validity check: {}", verdict.message),
            });
        }
    }

    ctx.close_subflow(&subflow, SubflowStatus::Complete, None)?;
    Ok(())
}

async fn request_merge_approval(
    ctx: &FlowCtx,
    worktree: &Worktree,
    target_branch: &str,
) -> Result<bool, FlowError> {
    let subflow = ctx.open_subflow("review")?;
    let mut action = FlowAction::new(ctx.workspace_id(), ctx.flow_id(), "merge_approval");
    action.is_human_action = true;
    action
        .action_params
        .insert("sourceBranch".into(), json!(worktree.name));
    action
        .action_params
        .insert("targetBranch".into(), json!(target_branch));
    let action = ctx.record_action(action)?;

    let response = ctx.await_human_response(&action.id).await?;
    let approved = response.approved.unwrap_or(false);
    ctx.close_subflow(
        &subflow,
        if approved {
            SubflowStatus::Complete
        } else {
            SubflowStatus::Failed
        },
        Some(json!({ "approved": approved })),
    )?;
    Ok(approved)
}

async fn merge_to_target(
    ctx: &FlowCtx,
    input: &FlowInput,
    worktree: &Worktree,
    target_branch: &str,
) -> Result<(), FlowError> {
    let subflow = ctx.open_subflow("merge")?;
    let params = MergeParams {
        source_branch: worktree.name.clone(),
        target_branch: target_branch.to_string(),
        strategy: input.merge_strategy,
        commit_message: None,
        committer_name: None,
        committer_email: None,
    };

    let mut outcome = merge_activity(ctx, "merge", &input.repo_dir, &params).await?;
    if outcome.has_conflicts {
        // Conflicts are an outcome, not an error: hand them to the user
        // as a human action, then verify resolution with a second merge.
        let mut action = FlowAction::new(ctx.workspace_id(), ctx.flow_id(), "merge_conflict");
        action.is_human_action = true;
        action
            .action_params
            .insert("outcome".into(), serde_json::to_value(&outcome)?);
        let action = ctx.record_action(action)?;
        let response = ctx.await_human_response(&action.id).await?;
        if !response.approved.unwrap_or(false) {
            ctx.close_subflow(&subflow, SubflowStatus::Failed, None)?;
            return Err(FlowError::StepFailed {
                message: "merge conflicts left unresolved".to_string(),
            });
        }
        outcome = merge_activity(ctx, "merge_after_resolution", &input.repo_dir, &params).await?;
    }

    if outcome.has_conflicts {
        ctx.close_subflow(
            &subflow,
            SubflowStatus::Failed,
            Some(serde_json::to_value(&outcome)?),
        )?;
        return Err(FlowError::StepFailed {
            message: format!(
                "merge of '{}' into '{}' still has conflicts",
                params.source_branch, params.target_branch
            ),
        });
    }
    ctx.close_subflow(&subflow, SubflowStatus::Complete, None)?;
    Ok(())
}

async fn merge_activity(
    ctx: &FlowCtx,
    name: &str,
    repo_dir: &std::path::Path,
    params: &MergeParams,
) -> Result<MergeOutcome, FlowError> {
    let repo_dir = repo_dir.to_path_buf();
    let params = params.clone();
    ctx.activity(name, ActivityOptions::default_policy(), move |_actx| {
        let repo_dir = repo_dir.clone();
        let params = params.clone();
        async move {
            tokio::task::spawn_blocking(move || {
                git::merge(&repo_dir, crate::exec::EnvType::LocalGitWorktree, &params).map_err(
                    |e| {
                        if e.is_precondition() {
                            ActivityError::non_retryable(e)
                        } else {
                            ActivityError::retryable(e)
                        }
                    },
                )
            })
            .await
            .map_err(|e| ActivityError::retryable(anyhow::anyhow!(e)))?
        }
    })
    .await
}

async fn cleanup(
    ctx: &FlowCtx,
    env: &ExecEnvironment,
    worktree: &Worktree,
) -> Result<(), FlowError> {
    let subflow = ctx.open_subflow("cleanup")?;
    let mut action = FlowAction::new(ctx.workspace_id(), ctx.flow_id(), "cleanup_worktree");
    action
        .action_params
        .insert("branch".into(), json!(worktree.name));
    let action = ctx.record_action(action)?;
    ctx.update_action(&action.id, ActionStatus::Started, None)?;

    let env = env.clone();
    let path = PathBuf::from(&worktree.path);
    let branch = worktree.name.clone();
    let worktree_id = worktree.id.clone();
    let message = format!("Archived by sidekick flow {}", ctx.flow_id());
    let db = ctx.db().clone();
    ctx.activity(
        "cleanup_worktree",
        ActivityOptions::default_policy(),
        move |_actx| {
            let env = env.clone();
            let path = path.clone();
            let branch = branch.clone();
            let worktree_id = worktree_id.clone();
            let message = message.clone();
            let db = db.clone();
            async move {
                git::cleanup_worktree(&env, &path, &branch, &message)
                    .await
                    .map_err(ActivityError::retryable)?;
                db.delete_worktree(&worktree_id)
                    .map_err(ActivityError::retryable)?;
                Ok(())
            }
        },
    )
    .await?;

    ctx.update_action(&action.id, ActionStatus::Complete, None)?;
    ctx.close_subflow(&subflow, SubflowStatus::Complete, None)?;
    Ok(())
}

fn tail(s: &str) -> String {
    const MAX: usize = 2000;
    if s.len() <= MAX {
        s.to_string()
    } else {
        let start = s.len() - MAX;
        // Avoid splitting a UTF-8 sequence.
        let start = (start..s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(start);
        format!("…{}", &s[start..])
    }
}
