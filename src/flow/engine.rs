//! The in-process durable engine: spawns flow executions, routes
//! signals, answers queries, and recovers non-terminal flows on startup
//! by deterministic replay.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::{Flow, FlowStatus, FlowType, TaskStatus};
use crate::store::Database;

use super::dev::{self, FlowInput};
use super::runtime::{FlowCtx, FlowError};

/// Buffered at-least-once signal delivery, keyed `(flow, channel)`.
/// Signals sent before the flow subscribes sit in the queue.
#[derive(Debug, Clone, Default)]
pub struct SignalHub {
    inner: Arc<Mutex<HashMap<(String, String), Channel>>>,
}

#[derive(Debug, Default)]
struct Channel {
    queue: VecDeque<Value>,
    notify: Arc<Notify>,
}

impl SignalHub {
    pub fn send(&self, flow_id: &str, channel: &str, payload: Value) {
        let mut map = self.inner.lock().expect("signal hub lock poisoned");
        let ch = map
            .entry((flow_id.to_string(), channel.to_string()))
            .or_default();
        ch.queue.push_back(payload);
        ch.notify.notify_one();
    }

    pub async fn receive(&self, flow_id: &str, channel: &str) -> Value {
        loop {
            let notify = {
                let mut map = self.inner.lock().expect("signal hub lock poisoned");
                let ch = map
                    .entry((flow_id.to_string(), channel.to_string()))
                    .or_default();
                if let Some(payload) = ch.queue.pop_front() {
                    return payload;
                }
                ch.notify.clone()
            };
            notify.notified().await;
        }
    }
}

/// Queryable view of a running flow, kept current by the flow itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSnapshot {
    pub status: FlowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_subflow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action_id: Option<String>,
}

impl FlowSnapshot {
    fn new(status: FlowStatus) -> Self {
        Self {
            status,
            current_subflow: None,
            last_action_id: None,
        }
    }
}

struct FlowHandle {
    cancel: CancellationToken,
    snapshot: Arc<Mutex<FlowSnapshot>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// The engine. One per process; shared behind `Arc`.
pub struct FlowEngine {
    db: Database,
    hub: SignalHub,
    flows: Mutex<HashMap<String, Arc<FlowHandle>>>,
}

impl FlowEngine {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(Self {
            db,
            hub: SignalHub::default(),
            flows: Mutex::new(HashMap::new()),
        })
    }

    pub fn signal_hub(&self) -> &SignalHub {
        &self.hub
    }

    /// Start (or restart) a flow execution. The input is persisted so a
    /// later process can recover the flow.
    pub fn start_flow(self: &Arc<Self>, flow: &Flow, input: FlowInput) -> Result<(), FlowError> {
        self.db
            .put_flow_input(&flow.id, &serde_json::to_value(&input)?)?;
        self.spawn(flow.clone(), input);
        Ok(())
    }

    fn spawn(self: &Arc<Self>, flow: Flow, input: FlowInput) {
        let cancel = CancellationToken::new();
        let snapshot = Arc::new(Mutex::new(FlowSnapshot::new(flow.status)));
        let handle = Arc::new(FlowHandle {
            cancel: cancel.clone(),
            snapshot: snapshot.clone(),
            join: Mutex::new(None),
        });

        let engine = self.clone();
        let flow_id = flow.id.clone();
        let join = tokio::spawn(async move {
            engine.drive(flow, input, cancel, snapshot).await;
        });
        *handle.join.lock().expect("flow handle lock poisoned") = Some(join);
        self.flows
            .lock()
            .expect("flow registry lock poisoned")
            .insert(flow_id, handle);
    }

    async fn drive(
        self: Arc<Self>,
        flow: Flow,
        input: FlowInput,
        cancel: CancellationToken,
        snapshot: Arc<Mutex<FlowSnapshot>>,
    ) {
        let ctx = match FlowCtx::new(
            flow.id.clone(),
            flow.workspace_id.clone(),
            self.db.clone(),
            cancel,
            self.hub.clone(),
            snapshot.clone(),
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                log::error!("flow {} failed to initialize: {e}", flow.id);
                let _ = self.db.set_flow_status(&flow.id, FlowStatus::Failed);
                self.settle_task(&flow.parent_id);
                return;
            }
        };

        let result = match flow.flow_type {
            FlowType::BasicDev => dev::basic_dev(&ctx, &input).await,
            FlowType::PlannedDev => dev::planned_dev(&ctx, &input).await,
        };

        let final_status = match &result {
            Ok(()) => FlowStatus::Complete,
            Err(FlowError::Canceled) => FlowStatus::Canceled,
            Err(e) => {
                log::error!("flow {} failed: {e}", flow.id);
                FlowStatus::Failed
            }
        };
        // Absorbing-transition errors here mean the status was already
        // terminal; nothing to do.
        let _ = self.db.set_flow_status(&flow.id, final_status);
        if let Ok(mut snap) = snapshot.lock() {
            snap.status = final_status;
        }
        self.settle_task(&flow.parent_id);
    }

    /// When every flow of a task is terminal, the task settles:
    /// all complete → complete; any failed → failed; else canceled.
    fn settle_task(&self, task_id: &str) {
        let Ok(flows) = self.db.flows_for_task(task_id) else {
            return;
        };
        if flows.is_empty() || !flows.iter().all(|f| f.status.is_terminal()) {
            return;
        }
        let status = if flows.iter().all(|f| f.status == FlowStatus::Complete) {
            TaskStatus::Complete
        } else if flows.iter().any(|f| f.status == FlowStatus::Failed) {
            TaskStatus::Failed
        } else {
            TaskStatus::Canceled
        };
        if let Err(e) = self.db.set_task_status(task_id, status) {
            log::debug!("task {task_id} already settled: {e}");
        }
    }

    /// Deliver a signal to a flow's named channel.
    pub fn signal(&self, flow_id: &str, channel: &str, payload: Value) {
        self.hub.send(flow_id, channel, payload);
    }

    /// Request cancellation; the flow observes it at its next activity
    /// boundary (or inside a cancellation-aware activity).
    pub fn cancel_flow(&self, flow_id: &str) {
        let handle = {
            let flows = self.flows.lock().expect("flow registry lock poisoned");
            flows.get(flow_id).cloned()
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
        } else {
            // Not running in this process; mark the record directly.
            let _ = self.db.set_flow_status(flow_id, FlowStatus::Canceled);
        }
    }

    /// Synchronous workflow query. Supported queries: `status`,
    /// `snapshot`, `subflows`.
    pub fn query(&self, flow_id: &str, query: &str, _args: Option<&Value>) -> Result<Value, FlowError> {
        let snapshot = {
            let flows = self.flows.lock().expect("flow registry lock poisoned");
            flows.get(flow_id).map(|h| {
                h.snapshot
                    .lock()
                    .expect("snapshot lock poisoned")
                    .clone()
            })
        };
        match query {
            "status" => {
                let status = match &snapshot {
                    Some(snap) => snap.status,
                    None => self.db.get_flow(flow_id)?.status,
                };
                Ok(serde_json::to_value(status)?)
            }
            "snapshot" => {
                let snap = match snapshot {
                    Some(snap) => snap,
                    None => FlowSnapshot::new(self.db.get_flow(flow_id)?.status),
                };
                Ok(serde_json::to_value(snap)?)
            }
            "subflows" => Ok(serde_json::to_value(self.db.subflows_for_flow(flow_id)?)?),
            other => Err(FlowError::Internal(format!("unknown query '{other}'"))),
        }
    }

    /// Re-spawn every non-terminal flow from the store. Called once at
    /// startup; returns how many flows resumed.
    pub fn recover(self: &Arc<Self>) -> Result<usize, FlowError> {
        let flows = self.db.non_terminal_flows()?;
        let mut resumed = 0;
        for flow in flows {
            match self.db.get_flow_input(&flow.id)? {
                Some(input) => {
                    let input: FlowInput = serde_json::from_value(input)?;
                    log::info!("recovering flow {} ({})", flow.id, flow.flow_type);
                    self.spawn(flow, input);
                    resumed += 1;
                }
                None => {
                    log::warn!("flow {} has no recorded input; marking failed", flow.id);
                    let _ = self.db.set_flow_status(&flow.id, FlowStatus::Failed);
                }
            }
        }
        Ok(resumed)
    }

    /// Await a flow's execution task. Test/shutdown helper; a missing or
    /// already-awaited handle is a no-op.
    pub async fn wait_for_flow(&self, flow_id: &str) {
        let join = {
            let flows = self.flows.lock().expect("flow registry lock poisoned");
            flows
                .get(flow_id)
                .and_then(|h| h.join.lock().expect("flow handle lock poisoned").take())
        };
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}
