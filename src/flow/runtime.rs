//! The durable-execution contract: replayable flow code, recorded
//! effects, activities with retry/heartbeat/cancellation semantics.
//!
//! A flow function is a replayable program. Every non-deterministic
//! effect (activity results, side effects including id generation, and
//! signal consumption) is recorded in the flow's append-only event log
//! at a dense sequence number. On recovery the function re-executes from
//! the top and recorded events are returned instead of re-running
//! effects, so the code path deterministically reaches the point where
//! it left off.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::model::{
    ActionStatus, FlowAction, FlowStatus, Subflow, SubflowStatus, UserResponse,
};
use crate::store::Database;

use super::engine::{FlowSnapshot, SignalHub};

/// Retry policy for one activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

/// Timeouts and retry behavior for one activity invocation.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub start_to_close: Duration,
    /// When set, the activity must heartbeat within this window or the
    /// attempt fails as timed out.
    pub heartbeat_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    /// The default workload class: 10 min start-to-close, 3 attempts,
    /// exponential backoff from 1 s (×3, capped at 10 s).
    pub fn default_policy() -> Self {
        Self {
            start_to_close: Duration::from_secs(600),
            heartbeat_timeout: None,
            retry: RetryPolicy {
                initial_interval: Duration::from_secs(1),
                backoff_coefficient: 3.0,
                max_interval: Duration::from_secs(10),
                max_attempts: 3,
            },
        }
    }

    /// LLM-class work: long streaming calls that must prove liveness.
    /// 10 min start-to-close, 40 s heartbeat, 4 attempts (×5, capped 20 s).
    pub fn llm() -> Self {
        Self {
            start_to_close: Duration::from_secs(600),
            heartbeat_timeout: Some(Duration::from_secs(40)),
            retry: RetryPolicy {
                initial_interval: Duration::from_secs(1),
                backoff_coefficient: 5.0,
                max_interval: Duration::from_secs(20),
                max_attempts: 4,
            },
        }
    }

    /// One attempt, 5 min.
    pub fn no_retry() -> Self {
        Self {
            start_to_close: Duration::from_secs(300),
            heartbeat_timeout: None,
            retry: RetryPolicy {
                initial_interval: Duration::from_secs(1),
                backoff_coefficient: 1.0,
                max_interval: Duration::from_secs(1),
                max_attempts: 1,
            },
        }
    }

    /// Two attempts, 30 s.
    pub fn single_retry() -> Self {
        Self {
            start_to_close: Duration::from_secs(30),
            heartbeat_timeout: None,
            retry: RetryPolicy {
                initial_interval: Duration::from_secs(1),
                backoff_coefficient: 1.0,
                max_interval: Duration::from_secs(1),
                max_attempts: 2,
            },
        }
    }

    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

/// One recorded effect in a flow's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowEvent {
    ActivityCompleted {
        seq: u64,
        name: String,
        result: Value,
    },
    ActivityFailed {
        seq: u64,
        name: String,
        error: String,
    },
    SideEffect {
        seq: u64,
        value: Value,
    },
    SignalReceived {
        seq: u64,
        channel: String,
        payload: Value,
    },
}

impl FlowEvent {
    fn seq(&self) -> u64 {
        match self {
            FlowEvent::ActivityCompleted { seq, .. }
            | FlowEvent::ActivityFailed { seq, .. }
            | FlowEvent::SideEffect { seq, .. }
            | FlowEvent::SignalReceived { seq, .. } => *seq,
        }
    }
}

/// How an activity attempt failed. Retryable errors re-run per the
/// policy; non-retryable ones (precondition violations) fail the
/// activity immediately.
#[derive(Debug)]
pub enum ActivityError {
    Retryable(anyhow::Error),
    NonRetryable(anyhow::Error),
}

impl ActivityError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        ActivityError::Retryable(err.into())
    }

    pub fn non_retryable(err: impl Into<anyhow::Error>) -> Self {
        ActivityError::NonRetryable(err.into())
    }

    fn message(&self) -> String {
        match self {
            ActivityError::Retryable(e) | ActivityError::NonRetryable(e) => format!("{e:#}"),
        }
    }
}

/// Errors terminating a flow.
#[derive(Debug)]
pub enum FlowError {
    /// An activity exhausted its retries or failed non-retryably.
    ActivityFailed { name: String, error: String },
    /// A step produced a result the flow treats as fatal (failed check,
    /// rejected approval).
    StepFailed { message: String },
    /// The flow observed cancellation.
    Canceled,
    /// Invariant violation: the code path diverged from the recorded
    /// history, or the store failed.
    Internal(String),
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowError::ActivityFailed { name, error } => {
                write!(f, "activity '{name}' failed: {error}")
            }
            FlowError::StepFailed { message } => write!(f, "{message}"),
            FlowError::Canceled => write!(f, "flow canceled"),
            FlowError::Internal(msg) => write!(f, "internal flow error: {msg}"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<crate::store::StoreError> for FlowError {
    fn from(e: crate::store::StoreError) -> Self {
        FlowError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Internal(e.to_string())
    }
}

/// Handed to each activity attempt: cancellation plus the heartbeat
/// recorder.
#[derive(Clone)]
pub struct ActivityCtx {
    pub cancel: CancellationToken,
    heartbeat: Arc<dyn Fn() + Send + Sync>,
}

impl ActivityCtx {
    /// Record a heartbeat, pushing out the heartbeat deadline.
    pub fn heartbeat(&self) {
        (self.heartbeat)();
    }

    /// The heartbeat recorder as a shareable callback (for APIs that
    /// take a plain `Fn`, like the command runner).
    pub fn heartbeat_fn(&self) -> Arc<dyn Fn() + Send + Sync> {
        self.heartbeat.clone()
    }
}

/// Tracks the heartbeat deadline for one attempt.
struct HeartbeatMonitor {
    deadline: Option<Arc<std::sync::Mutex<tokio::time::Instant>>>,
    timeout: Option<Duration>,
}

impl HeartbeatMonitor {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout
                .map(|t| Arc::new(std::sync::Mutex::new(tokio::time::Instant::now() + t))),
            timeout,
        }
    }

    fn recorder(&self) -> Arc<dyn Fn() + Send + Sync> {
        match (&self.deadline, self.timeout) {
            (Some(deadline), Some(timeout)) => {
                let deadline = deadline.clone();
                Arc::new(move || {
                    let mut d = deadline.lock().expect("heartbeat lock poisoned");
                    *d = tokio::time::Instant::now() + timeout;
                })
            }
            _ => Arc::new(|| {}),
        }
    }

    /// Resolves when the heartbeat deadline passes; never resolves for
    /// activities without a heartbeat timeout.
    async fn expired(&self) {
        let Some(deadline) = &self.deadline else {
            return std::future::pending().await;
        };
        loop {
            let at = *deadline.lock().expect("heartbeat lock poisoned");
            if tokio::time::Instant::now() >= at {
                return;
            }
            tokio::time::sleep_until(at).await;
        }
    }
}

/// The flow's handle to the durable runtime. One per flow execution;
/// logically single-threaded.
pub struct FlowCtx {
    flow_id: String,
    workspace_id: String,
    db: Database,
    cancel: CancellationToken,
    signals: SignalHub,
    snapshot: Arc<std::sync::Mutex<FlowSnapshot>>,
    /// Events recorded by previous executions, replayed by sequence.
    recorded: Vec<FlowEvent>,
    seq: AtomicU64,
    subflow_stack: std::sync::Mutex<Vec<String>>,
}

impl FlowCtx {
    pub(super) fn new(
        flow_id: String,
        workspace_id: String,
        db: Database,
        cancel: CancellationToken,
        signals: SignalHub,
        snapshot: Arc<std::sync::Mutex<FlowSnapshot>>,
    ) -> Result<Self, FlowError> {
        let recorded: Vec<FlowEvent> = db
            .list_flow_events(&flow_id)?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;
        // The log is written densely; a gap means corruption.
        for (i, event) in recorded.iter().enumerate() {
            if event.seq() != i as u64 {
                return Err(FlowError::Internal(format!(
                    "event log gap for flow {flow_id}: index {i} holds seq {}",
                    event.seq()
                )));
            }
        }
        Ok(Self {
            flow_id,
            workspace_id,
            db,
            cancel,
            signals,
            snapshot,
            recorded,
            seq: AtomicU64::new(0),
            subflow_stack: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn record(&self, event: FlowEvent) -> Result<(), FlowError> {
        let seq = event.seq();
        self.db
            .append_flow_event(&self.flow_id, seq, &serde_json::to_value(&event)?)?;
        Ok(())
    }

    /// Run a side-effectful activity with at-most-once recording.
    ///
    /// On replay a recorded outcome at this sequence is returned without
    /// re-running. Live attempts race the start-to-close timeout, the
    /// heartbeat deadline and cancellation; retryable failures back off
    /// per the policy.
    pub async fn activity<T, F, Fut>(
        &self,
        name: &str,
        opts: ActivityOptions,
        run: F,
    ) -> Result<T, FlowError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(ActivityCtx) -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let seq = self.next_seq();
        if let Some(event) = self.recorded.get(seq as usize) {
            return match event {
                FlowEvent::ActivityCompleted { name: n, result, .. } if n == name => {
                    Ok(serde_json::from_value(result.clone())?)
                }
                FlowEvent::ActivityFailed { name: n, error, .. } if n == name => {
                    Err(FlowError::ActivityFailed {
                        name: name.to_string(),
                        error: error.clone(),
                    })
                }
                other => Err(replay_divergence(seq, &format!("activity '{name}'"), other)),
            };
        }

        let mut attempt = 1u32;
        let mut backoff = opts.retry.initial_interval;
        loop {
            if self.cancel.is_cancelled() {
                return Err(FlowError::Canceled);
            }

            let monitor = HeartbeatMonitor::new(opts.heartbeat_timeout);
            let actx = ActivityCtx {
                cancel: self.cancel.clone(),
                heartbeat: monitor.recorder(),
            };

            let attempt_result: Result<T, ActivityError> = tokio::select! {
                res = tokio::time::timeout(opts.start_to_close, run(actx)) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(ActivityError::retryable(anyhow::anyhow!(
                        "start-to-close timeout after {:?}",
                        opts.start_to_close
                    ))),
                },
                _ = monitor.expired() => Err(ActivityError::retryable(anyhow::anyhow!(
                    "missed heartbeat (timeout {:?})",
                    opts.heartbeat_timeout
                ))),
                _ = self.cancel.cancelled() => return Err(FlowError::Canceled),
            };

            match attempt_result {
                Ok(value) => {
                    self.record(FlowEvent::ActivityCompleted {
                        seq,
                        name: name.to_string(),
                        result: serde_json::to_value(&value)?,
                    })?;
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = matches!(err, ActivityError::Retryable(_));
                    let message = err.message();
                    if !retryable || attempt >= opts.retry.max_attempts {
                        self.record(FlowEvent::ActivityFailed {
                            seq,
                            name: name.to_string(),
                            error: message.clone(),
                        })?;
                        return Err(FlowError::ActivityFailed {
                            name: name.to_string(),
                            error: message,
                        });
                    }
                    log::warn!(
                        "activity '{}' attempt {}/{} failed, retrying in {:?}: {}",
                        name,
                        attempt,
                        opts.retry.max_attempts,
                        backoff,
                        message
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => return Err(FlowError::Canceled),
                    }
                    backoff = backoff
                        .mul_f64(opts.retry.backoff_coefficient)
                        .min(opts.retry.max_interval);
                    attempt += 1;
                }
            }
        }
    }

    /// Record a non-deterministic value so replay reproduces it.
    pub fn side_effect<T, F>(&self, f: F) -> Result<T, FlowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let seq = self.next_seq();
        if let Some(event) = self.recorded.get(seq as usize) {
            return match event {
                FlowEvent::SideEffect { value, .. } => Ok(serde_json::from_value(value.clone())?),
                other => Err(replay_divergence(seq, "side effect", other)),
            };
        }
        let value = f();
        self.record(FlowEvent::SideEffect {
            seq,
            value: serde_json::to_value(&value)?,
        })?;
        Ok(value)
    }

    /// Mint an id through a recorded side effect, so replay produces the
    /// same id.
    pub fn new_id(&self, prefix: &str) -> Result<String, FlowError> {
        self.side_effect(|| crate::new_id(prefix))
    }

    /// Await the next signal on a named channel. Consumption is recorded,
    /// so a replayed flow sees the same payload at the same point.
    /// Delivery is at-least-once; handlers must be idempotent.
    pub async fn receive_signal(&self, channel: &str) -> Result<Value, FlowError> {
        let seq = self.next_seq();
        if let Some(event) = self.recorded.get(seq as usize) {
            return match event {
                FlowEvent::SignalReceived { channel: c, payload, .. } if c == channel => {
                    Ok(payload.clone())
                }
                other => Err(replay_divergence(seq, &format!("signal '{channel}'"), other)),
            };
        }
        let payload = tokio::select! {
            payload = self.signals.receive(&self.flow_id, channel) => payload,
            _ = self.cancel.cancelled() => return Err(FlowError::Canceled),
        };
        self.record(FlowEvent::SignalReceived {
            seq,
            channel: channel.to_string(),
            payload: payload.clone(),
        })?;
        Ok(payload)
    }

    // =========================================================================
    // Flow/subflow/action state helpers
    // =========================================================================

    /// Update the flow's persisted status and the query snapshot.
    pub fn set_flow_status(&self, status: FlowStatus) -> Result<(), FlowError> {
        self.db.set_flow_status(&self.flow_id, status)?;
        if let Ok(mut snap) = self.snapshot.lock() {
            snap.status = status;
        }
        Ok(())
    }

    /// Open a subflow as a child of the current top of the stack.
    pub fn open_subflow(&self, name: &str) -> Result<Subflow, FlowError> {
        let parent = self
            .subflow_stack
            .lock()
            .expect("subflow stack lock poisoned")
            .last()
            .cloned();
        let id = self.new_id("sf")?;
        // Idempotent on replay: the id is a recorded side effect, so a
        // previous execution's record (possibly already closed) wins.
        let subflow = match self.db.get_subflow(&id) {
            Ok(existing) => existing,
            Err(_) => {
                let subflow = Subflow {
                    id,
                    workspace_id: self.workspace_id.clone(),
                    flow_id: self.flow_id.clone(),
                    parent_subflow_id: parent,
                    name: name.to_string(),
                    description: None,
                    status: SubflowStatus::InProgress,
                    result: None,
                };
                self.db.put_subflow(&subflow)?;
                subflow
            }
        };
        self.subflow_stack
            .lock()
            .expect("subflow stack lock poisoned")
            .push(subflow.id.clone());
        if let Ok(mut snap) = self.snapshot.lock() {
            snap.current_subflow = Some(subflow.name.clone());
        }
        Ok(subflow)
    }

    /// Close the innermost subflow. `complete|failed` is terminal.
    pub fn close_subflow(
        &self,
        subflow: &Subflow,
        status: SubflowStatus,
        result: Option<Value>,
    ) -> Result<(), FlowError> {
        let mut record = self.db.get_subflow(&subflow.id)?;
        if !record.status.is_terminal() {
            record.status = status;
            record.result = result;
            self.db.put_subflow(&record)?;
        }
        let mut stack = self.subflow_stack.lock().expect("subflow stack lock poisoned");
        if stack.last() == Some(&subflow.id) {
            stack.pop();
        }
        if let Ok(mut snap) = self.snapshot.lock() {
            snap.current_subflow = stack
                .last()
                .and_then(|id| self.db.get_subflow(id).ok())
                .map(|s| s.name);
        }
        Ok(())
    }

    /// Record a flow action under the current subflow. Idempotent on
    /// replay (the id is a recorded side effect).
    pub fn record_action(&self, mut action: FlowAction) -> Result<FlowAction, FlowError> {
        action.id = self.new_id("fa")?;
        action.subflow_id = self
            .subflow_stack
            .lock()
            .expect("subflow stack lock poisoned")
            .last()
            .cloned();
        let existing = self.db.get_flow_action(&action.id);
        let action = match existing {
            Ok(existing) => existing,
            Err(_) => self.db.create_flow_action(action)?,
        };
        if let Ok(mut snap) = self.snapshot.lock() {
            snap.last_action_id = Some(action.id.clone());
        }
        Ok(action)
    }

    /// Move an action along its lifecycle, tolerating replay (an action
    /// already past the requested status is left alone).
    pub fn update_action(
        &self,
        action_id: &str,
        status: ActionStatus,
        result: Option<String>,
    ) -> Result<(), FlowError> {
        let current = self.db.get_flow_action(action_id)?;
        if current.action_status.can_transition_to(status) {
            self.db.transition_flow_action(action_id, status, result)?;
        }
        Ok(())
    }

    /// Park the flow on a pending human action: status goes to
    /// `awaiting_human` until the user's response arrives on the action's
    /// signal channel.
    pub async fn await_human_response(&self, action_id: &str) -> Result<UserResponse, FlowError> {
        self.set_flow_status(FlowStatus::AwaitingHuman)?;
        let payload = self.receive_signal(&action_channel(action_id)).await?;
        self.set_flow_status(FlowStatus::InProgress)?;
        Ok(serde_json::from_value(payload)?)
    }
}

/// Signal channel name for one human action's completion.
pub fn action_channel(action_id: &str) -> String {
    format!("action:{action_id}")
}

fn replay_divergence(seq: u64, expected: &str, found: &FlowEvent) -> FlowError {
    FlowError::Internal(format!(
        "replay divergence at seq {seq}: code asked for {expected} but history holds {found:?}"
    ))
}
