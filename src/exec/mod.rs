//! Execution environments: command execution bound to a working directory.
//!
//! Every command a flow runs goes through [`ExecEnvironment::run_command`]
//! as the single choke point, with debug logging and tracing, so a
//! `SIDE_LOG_LEVEL=0` run shows each spawned process and how long it took.
//!
//! A non-zero exit status is **not** an error here. Callers need to
//! distinguish "ran and said no" from "could not run": only spawn/IO
//! failures (including a missing working directory, reported up front)
//! surface as `Err`. Exit status, stdout and stderr are data.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Cadence of the background heartbeat while a child process runs.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Environment variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EnvType {
    Local,
    LocalGitWorktree,
}

/// An isolated place to run commands. Serialization carries the variant
/// tag so persisted environments rehydrate across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecEnvironment {
    /// The workspace's own repository checkout.
    Local { working_directory: PathBuf },
    /// A per-flow git worktree; `branch` doubles as the worktree name.
    LocalGitWorktree {
        working_directory: PathBuf,
        branch: String,
    },
}

/// Input for one command run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInput {
    /// Directory to run in, relative to the environment's working
    /// directory. Must not escape it.
    #[serde(default)]
    pub relative_working_dir: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env_vars: IndexMap<String, String>,
}

impl CommandInput {
    pub fn new(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            relative_working_dir: String::new(),
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env_vars: IndexMap::new(),
        }
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Outcome of a command that actually ran. Exit status is verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

impl ExecEnvironment {
    /// A local environment rooted at `dir`. The directory must exist; the
    /// stored path is symlink-resolved.
    pub fn local(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::Local {
            working_directory: canonical_dir(dir.as_ref())?,
        })
    }

    /// A worktree environment rooted at `dir` for `branch`.
    pub fn worktree(dir: impl AsRef<Path>, branch: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self::LocalGitWorktree {
            working_directory: canonical_dir(dir.as_ref())?,
            branch: branch.into(),
        })
    }

    pub fn env_type(&self) -> EnvType {
        match self {
            ExecEnvironment::Local { .. } => EnvType::Local,
            ExecEnvironment::LocalGitWorktree { .. } => EnvType::LocalGitWorktree,
        }
    }

    /// Absolute, symlink-resolved root of this environment.
    pub fn working_directory(&self) -> &Path {
        match self {
            ExecEnvironment::Local { working_directory }
            | ExecEnvironment::LocalGitWorktree {
                working_directory, ..
            } => working_directory,
        }
    }

    /// Run a command to completion. See the module docs for the error
    /// contract.
    pub async fn run_command(&self, input: &CommandInput) -> anyhow::Result<CommandOutput> {
        self.run_command_inner(input, None, &CancellationToken::new())
            .await
    }

    /// Run a command with a background heartbeat: `heartbeat` is invoked
    /// every [`HEARTBEAT_INTERVAL`] while the child runs. Cancelling
    /// `cancel` kills the child and surfaces an error.
    pub async fn run_command_with_heartbeat(
        &self,
        input: &CommandInput,
        heartbeat: &(dyn Fn() + Send + Sync),
        cancel: &CancellationToken,
    ) -> anyhow::Result<CommandOutput> {
        self.run_command_inner(input, Some(heartbeat), cancel).await
    }

    async fn run_command_inner(
        &self,
        input: &CommandInput,
        heartbeat: Option<&(dyn Fn() + Send + Sync)>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<CommandOutput> {
        let dir = self.resolve_working_dir(&input.relative_working_dir)?;

        let mut cmd = tokio::process::Command::new(&input.command);
        cmd.args(&input.args)
            .current_dir(&dir)
            // Keep git from ever blocking a flow on an interactive editor.
            .env("GIT_EDITOR", "true")
            .envs(&input.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("$ {} [{}]", input.display(), dir.display());
        let t0 = Instant::now();

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", input.display()))?;

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so heartbeats start
        // one interval in.
        ticker.tick().await;

        enum Event {
            Exited(std::io::Result<std::process::ExitStatus>),
            Tick,
            Canceled,
        }

        let status = loop {
            // The select only produces an event; `child` is free again by
            // the time the event is handled.
            let event = tokio::select! {
                status = child.wait() => Event::Exited(status),
                _ = ticker.tick() => Event::Tick,
                _ = cancel.cancelled() => Event::Canceled,
            };
            match event {
                Event::Exited(status) => {
                    break status.context("Failed to wait for child process")?;
                }
                Event::Tick => {
                    if let Some(beat) = heartbeat {
                        beat();
                    }
                }
                Event::Canceled => {
                    let _ = child.kill().await;
                    bail!("command '{}' canceled", input.display());
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_status = status.code().unwrap_or(-1);

        log::debug!(
            "[side-trace] cmd=\"{}\" dur={:.1}ms exit={}",
            input.display(),
            t0.elapsed().as_secs_f64() * 1000.0,
            exit_status
        );

        Ok(CommandOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Join `relative` onto the working directory, rejecting absolute
    /// paths and any `..` component, and requiring the result to exist.
    fn resolve_working_dir(&self, relative: &str) -> anyhow::Result<PathBuf> {
        let root = self.working_directory();
        if relative.is_empty() || relative == "." {
            return Ok(root.to_path_buf());
        }
        let rel = Path::new(relative);
        if rel.is_absolute() {
            bail!("relative working dir must not be absolute: {relative}");
        }
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            bail!("relative working dir must not escape the environment: {relative}");
        }
        let dir = root.join(rel);
        if !dir.is_dir() {
            bail!("working directory does not exist: {}", dir.display());
        }
        Ok(dir)
    }
}

fn canonical_dir(dir: &Path) -> anyhow::Result<PathBuf> {
    let resolved = dunce::canonicalize(dir)
        .with_context(|| format!("working directory does not exist: {}", dir.display()))?;
    if !resolved.is_dir() {
        bail!("not a directory: {}", resolved.display());
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local_env() -> (tempfile::TempDir, ExecEnvironment) {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecEnvironment::local(dir.path()).unwrap();
        (dir, env)
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let (_dir, env) = local_env();
        let out = env
            .run_command(&CommandInput::new("sh", ["-c", "echo no >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_status, 3);
        assert!(!out.success());
        assert_eq!(out.stderr.trim(), "no");
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let (_dir, env) = local_env();
        let err = env
            .run_command(&CommandInput::new(
                "definitely-not-a-real-binary-4db1",
                Vec::<String>::new(),
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn env_vars_and_git_editor_are_injected() {
        let (_dir, env) = local_env();
        let mut input = CommandInput::new("sh", ["-c", "printf '%s %s' \"$SIDE_TEST\" \"$GIT_EDITOR\""]);
        input.env_vars.insert("SIDE_TEST".into(), "hello".into());
        let out = env.run_command(&input).await.unwrap();
        assert_eq!(out.stdout, "hello true");
    }

    #[tokio::test]
    async fn relative_dir_cannot_escape() {
        let (_dir, env) = local_env();
        let mut input = CommandInput::new("true", Vec::<String>::new());
        input.relative_working_dir = "../outside".into();
        let err = env.run_command(&input).await.unwrap_err();
        assert!(err.to_string().contains("escape"));
    }

    #[tokio::test]
    async fn missing_working_dir_reported_up_front() {
        let (_dir, env) = local_env();
        let mut input = CommandInput::new("true", Vec::<String>::new());
        input.relative_working_dir = "nope".into();
        let err = env.run_command(&input).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn relative_dir_runs_in_subdirectory() {
        let (dir, env) = local_env();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut input = CommandInput::new("pwd", Vec::<String>::new());
        input.relative_working_dir = "sub".into();
        let out = env.run_command(&input).await.unwrap();
        assert!(out.stdout.trim().ends_with("sub"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_while_child_runs() {
        let (_dir, env) = local_env();
        let beats = Arc::new(AtomicUsize::new(0));
        let beats_clone = beats.clone();
        let cancel = CancellationToken::new();
        // Auto-advanced virtual time makes the 1s sleep and the 5s ticker
        // resolve instantly; the ticker gets at least one tick in.
        let out = env
            .run_command_with_heartbeat(
                &CommandInput::new("sh", ["-c", "sleep 1"]),
                &move || {
                    beats_clone.fetch_add(1, Ordering::SeqCst);
                },
                &cancel,
            )
            .await
            .unwrap();
        assert!(out.success());
        assert!(beats.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let (_dir, env) = local_env();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = env
            .run_command_with_heartbeat(
                &CommandInput::new("sleep", ["30"]),
                &|| {},
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("canceled"));
    }

    #[test]
    fn serialization_carries_variant_tag() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecEnvironment::worktree(dir.path(), "side/feature").unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "local_git_worktree");
        let back: ExecEnvironment = serde_json::from_value(json).unwrap();
        assert_eq!(back.env_type(), EnvType::LocalGitWorktree);
    }
}
