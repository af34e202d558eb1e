//! Persistence: the key-value contract, the typed database layer, and the
//! append-only flow-action log.
//!
//! The backend is deliberately small: any store that can put/get/delete
//! JSON values under `(namespace, key)` and list a namespace in key order
//! satisfies [`KvStore`]. Entity keys are ksuid-prefixed ids, so key order
//! is creation order and listing needs no secondary index.
//!
//! [`Database`] is the typed layer everything else talks to. It owns the
//! invariants the raw store can't express: legal flow-action transitions,
//! reference checks, monotone terminal statuses.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::model::{
    ActionStatus, Flow, FlowAction, FlowStatus, Message, Subflow, Task, TaskStatus, Topic,
    UserResponse, Workspace, Worktree,
};

/// Errors surfaced by the persistence layer.
#[derive(Debug)]
pub enum StoreError {
    /// Entity lookup failed.
    NotFound { kind: &'static str, id: String },
    /// A status transition outside the legal edges was requested.
    InvalidTransition { from: String, to: String },
    /// `complete` was called on an action that isn't a human action.
    NotHumanAction { id: String },
    /// A record referenced another entity that doesn't exist (e.g. a flow
    /// action naming a subflow from a different flow).
    InvalidReference { message: String },
    /// Serialization failure.
    Serde(serde_json::Error),
    /// Backend-specific failure.
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            StoreError::InvalidTransition { from, to } => {
                write!(f, "illegal status transition {from} -> {to}")
            }
            StoreError::NotHumanAction { id } => {
                write!(f, "flow action {id} is not a human action")
            }
            StoreError::InvalidReference { message } => write!(f, "{message}"),
            StoreError::Serde(e) => write!(f, "serialization error: {e}"),
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

impl StoreError {
    /// Whether the error is a caller mistake (maps to 4xx at the HTTP
    /// boundary) as opposed to a backend fault.
    pub fn is_precondition(&self) -> bool {
        !matches!(self, StoreError::Serde(_) | StoreError::Backend(_))
    }
}

/// The persistence contract sidekick requires of a backend.
///
/// `list` must return values in ascending key order; ids embed creation
/// time, so that doubles as creation order.
pub trait KvStore: Send + Sync + std::fmt::Debug {
    fn put(&self, ns: &str, key: &str, value: Value) -> Result<(), StoreError>;
    fn get(&self, ns: &str, key: &str) -> Result<Option<Value>, StoreError>;
    fn delete(&self, ns: &str, key: &str) -> Result<(), StoreError>;
    fn list(&self, ns: &str) -> Result<Vec<Value>, StoreError>;
}

mod ns {
    pub const WORKSPACE: &str = "workspace";
    pub const TASK: &str = "task";
    pub const FLOW: &str = "flow";
    pub const SUBFLOW: &str = "subflow";
    pub const FLOW_ACTION: &str = "flow_action";
    pub const FLOW_INPUT: &str = "flow_input";
    pub const TOPIC: &str = "topic";
    pub const WORKTREE: &str = "worktree";

    /// Per-topic message logs, scanned in append order.
    pub fn messages(topic_id: &str) -> String {
        format!("messages:{topic_id}")
    }

    /// Per-flow event logs get their own namespace so replay reads are a
    /// single ordered scan.
    pub fn flow_events(flow_id: &str) -> String {
        format!("flow_events:{flow_id}")
    }
}

/// Typed persistence layer shared across the orchestrator, engine and
/// HTTP handlers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    kv: Arc<dyn KvStore>,
}

impl Database {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn put<T: Serialize>(&self, ns: &str, key: &str, value: &T) -> Result<(), StoreError> {
        self.kv.put(ns, key, serde_json::to_value(value)?)
    }

    fn get<T: DeserializeOwned>(
        &self,
        ns: &str,
        kind: &'static str,
        key: &str,
    ) -> Result<T, StoreError> {
        let value = self.kv.get(ns, key)?.ok_or_else(|| StoreError::NotFound {
            kind,
            id: key.to_string(),
        })?;
        Ok(serde_json::from_value(value)?)
    }

    fn list<T: DeserializeOwned>(&self, ns: &str) -> Result<Vec<T>, StoreError> {
        self.kv
            .list(ns)?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    // =========================================================================
    // Workspaces
    // =========================================================================

    pub fn put_workspace(&self, ws: &Workspace) -> Result<(), StoreError> {
        self.put(ns::WORKSPACE, &ws.id, ws)
    }

    pub fn get_workspace(&self, id: &str) -> Result<Workspace, StoreError> {
        self.get(ns::WORKSPACE, "workspace", id)
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        self.list(ns::WORKSPACE)
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.put(ns::TASK, &task.id, task)
    }

    pub fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        self.get(ns::TASK, "task", id)
    }

    /// Update a task's status. Terminal statuses absorb: an attempt to
    /// move a task out of complete/failed/canceled is rejected.
    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<Task, StoreError> {
        let mut task: Task = self.get_task(id)?;
        if task.status.is_terminal() && task.status != status {
            return Err(StoreError::InvalidTransition {
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }
        task.status = status;
        task.updated = Utc::now();
        self.put_task(&task)?;
        Ok(task)
    }

    // =========================================================================
    // Flows
    // =========================================================================

    pub fn put_flow(&self, flow: &Flow) -> Result<(), StoreError> {
        self.put(ns::FLOW, &flow.id, flow)
    }

    pub fn get_flow(&self, id: &str) -> Result<Flow, StoreError> {
        self.get(ns::FLOW, "flow", id)
    }

    pub fn flows_for_task(&self, task_id: &str) -> Result<Vec<Flow>, StoreError> {
        let flows: Vec<Flow> = self.list(ns::FLOW)?;
        Ok(flows.into_iter().filter(|f| f.parent_id == task_id).collect())
    }

    /// Update a flow's status; terminal statuses absorb.
    pub fn set_flow_status(&self, id: &str, status: FlowStatus) -> Result<Flow, StoreError> {
        let mut flow = self.get_flow(id)?;
        if flow.status.is_terminal() && flow.status != status {
            return Err(StoreError::InvalidTransition {
                from: flow.status.to_string(),
                to: status.to_string(),
            });
        }
        flow.status = status;
        self.put_flow(&flow)?;
        Ok(flow)
    }

    /// All flows that haven't reached a terminal status. Used for
    /// recovery on startup.
    pub fn non_terminal_flows(&self) -> Result<Vec<Flow>, StoreError> {
        let flows: Vec<Flow> = self.list(ns::FLOW)?;
        Ok(flows.into_iter().filter(|f| !f.status.is_terminal()).collect())
    }

    // =========================================================================
    // Subflows
    // =========================================================================

    pub fn put_subflow(&self, subflow: &Subflow) -> Result<(), StoreError> {
        self.put(ns::SUBFLOW, &subflow.id, subflow)
    }

    pub fn get_subflow(&self, id: &str) -> Result<Subflow, StoreError> {
        self.get(ns::SUBFLOW, "subflow", id)
    }

    pub fn subflows_for_flow(&self, flow_id: &str) -> Result<Vec<Subflow>, StoreError> {
        let subflows: Vec<Subflow> = self.list(ns::SUBFLOW)?;
        Ok(subflows.into_iter().filter(|s| s.flow_id == flow_id).collect())
    }

    // =========================================================================
    // Flow actions (append-only log)
    // =========================================================================

    /// Record a new flow action. The action must reference an existing
    /// flow, and its subflow (if any) must belong to the same flow. The
    /// initial status is always `pending`.
    pub fn create_flow_action(&self, mut action: FlowAction) -> Result<FlowAction, StoreError> {
        let flow = self.get_flow(&action.flow_id)?;
        if let Some(subflow_id) = &action.subflow_id {
            let subflow = self.get_subflow(subflow_id)?;
            if subflow.flow_id != flow.id {
                return Err(StoreError::InvalidReference {
                    message: format!(
                        "subflow {} belongs to flow {}, not {}",
                        subflow_id, subflow.flow_id, flow.id
                    ),
                });
            }
        }
        action.action_status = ActionStatus::Pending;
        action.updated = Utc::now();
        self.put(ns::FLOW_ACTION, &action.id, &action)?;
        Ok(action)
    }

    pub fn get_flow_action(&self, id: &str) -> Result<FlowAction, StoreError> {
        self.get(ns::FLOW_ACTION, "flow action", id)
    }

    /// Move an action along the legal edges
    /// `pending → started → (complete|failed)`. Once terminal the action
    /// is immutable; the `updated` stamp is monotone.
    pub fn transition_flow_action(
        &self,
        id: &str,
        status: ActionStatus,
        result: Option<String>,
    ) -> Result<FlowAction, StoreError> {
        let mut action = self.get_flow_action(id)?;
        if !action.action_status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: action.action_status.to_string(),
                to: status.to_string(),
            });
        }
        action.action_status = status;
        if let Some(result) = result {
            action.action_result = result;
        }
        action.updated = Utc::now();
        self.put(ns::FLOW_ACTION, &action.id, &action)?;
        Ok(action)
    }

    /// List a flow's actions in creation order. `after` is a paging
    /// cursor: the last-seen action id.
    ///
    /// Ids alone only order to the second (the ksuid timestamp), so the
    /// sort key is the full creation stamp with the id as tiebreaker.
    pub fn list_flow_actions(
        &self,
        flow_id: &str,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<FlowAction>, StoreError> {
        let mut actions: Vec<FlowAction> = self
            .list(ns::FLOW_ACTION)?
            .into_iter()
            .filter(|a: &FlowAction| a.flow_id == flow_id)
            .collect();
        actions.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        let start = match after {
            Some(cursor) => actions
                .iter()
                .position(|a| a.id == cursor)
                .map_or(0, |i| i + 1),
            None => 0,
        };
        let iter = actions.into_iter().skip(start);
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    /// Validate and apply a user response to a human action.
    ///
    /// Only legal for `is_human_action` actions still in pending/started.
    /// Delivery of the response into the flow (the signal) is the
    /// orchestrator's job; this just owns the record transition.
    pub fn complete_human_action(
        &self,
        id: &str,
        response: &UserResponse,
    ) -> Result<FlowAction, StoreError> {
        let action = self.get_flow_action(id)?;
        if !action.is_human_action {
            return Err(StoreError::NotHumanAction { id: id.to_string() });
        }
        if action.action_status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: action.action_status.to_string(),
                to: ActionStatus::Complete.to_string(),
            });
        }
        let result = serde_json::to_string(response)?;
        self.transition_flow_action(id, ActionStatus::Complete, Some(result))
    }

    // =========================================================================
    // Worktrees
    // =========================================================================

    pub fn put_worktree(&self, worktree: &Worktree) -> Result<(), StoreError> {
        self.put(ns::WORKTREE, &worktree.id, worktree)
    }

    pub fn delete_worktree(&self, id: &str) -> Result<(), StoreError> {
        self.kv.delete(ns::WORKTREE, id)
    }

    pub fn worktrees_for_workspace(&self, workspace_id: &str) -> Result<Vec<Worktree>, StoreError> {
        let worktrees: Vec<Worktree> = self.list(ns::WORKTREE)?;
        Ok(worktrees
            .into_iter()
            .filter(|w| w.workspace_id == workspace_id)
            .collect())
    }

    // =========================================================================
    // Topics & messages
    // =========================================================================

    pub fn put_topic(&self, topic: &Topic) -> Result<(), StoreError> {
        self.put(ns::TOPIC, &topic.id, topic)
    }

    pub fn get_topic(&self, id: &str) -> Result<Topic, StoreError> {
        self.get(ns::TOPIC, "topic", id)
    }

    /// Append one message to a topic's transcript. The transcript is
    /// append-only; messages are never rewritten.
    pub fn append_message(&self, message: &Message) -> Result<(), StoreError> {
        self.get_topic(&message.topic_id)?;
        self.put(&ns::messages(&message.topic_id), &message.id, message)
    }

    pub fn list_messages(&self, topic_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut messages: Vec<Message> = self.list(&ns::messages(topic_id))?;
        messages.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Persist the input a flow was started with, for recovery.
    pub fn put_flow_input(&self, flow_id: &str, input: &Value) -> Result<(), StoreError> {
        self.kv.put(ns::FLOW_INPUT, flow_id, input.clone())
    }

    pub fn get_flow_input(&self, flow_id: &str) -> Result<Option<Value>, StoreError> {
        self.kv.get(ns::FLOW_INPUT, flow_id)
    }

    // =========================================================================
    // Flow event log (durable replay)
    // =========================================================================

    /// Append one event to a flow's replay log at the given sequence
    /// number. Sequence numbers are dense and assigned by the engine.
    pub fn append_flow_event(&self, flow_id: &str, seq: u64, event: &Value) -> Result<(), StoreError> {
        self.kv
            .put(&ns::flow_events(flow_id), &format!("{seq:020}"), event.clone())
    }

    /// Read a flow's full replay log in sequence order.
    pub fn list_flow_events(&self, flow_id: &str) -> Result<Vec<Value>, StoreError> {
        self.kv.list(&ns::flow_events(flow_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlowType, SubflowStatus};

    fn seed_flow(db: &Database) -> Flow {
        let flow = Flow {
            id: crate::new_id("flow"),
            workspace_id: "ws_1".into(),
            parent_id: "task_1".into(),
            flow_type: FlowType::BasicDev,
            topic_id: None,
            status: FlowStatus::Started,
        };
        db.put_flow(&flow).unwrap();
        flow
    }

    #[test]
    fn flow_action_lifecycle_follows_legal_edges() {
        let db = Database::in_memory();
        let flow = seed_flow(&db);

        let action = db
            .create_flow_action(FlowAction::new("ws_1", &flow.id, "run_command"))
            .unwrap();
        assert_eq!(action.action_status, ActionStatus::Pending);

        db.transition_flow_action(&action.id, ActionStatus::Started, None)
            .unwrap();
        let done = db
            .transition_flow_action(&action.id, ActionStatus::Complete, Some("ok".into()))
            .unwrap();
        assert_eq!(done.action_result, "ok");

        // Terminal actions are immutable.
        let err = db
            .transition_flow_action(&action.id, ActionStatus::Failed, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn flow_action_requires_existing_flow() {
        let db = Database::in_memory();
        let err = db
            .create_flow_action(FlowAction::new("ws_1", "flow_missing", "edit"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "flow", .. }));
    }

    #[test]
    fn subflow_must_belong_to_same_flow() {
        let db = Database::in_memory();
        let flow_a = seed_flow(&db);
        let flow_b = seed_flow(&db);
        let subflow = Subflow {
            id: crate::new_id("sf"),
            workspace_id: "ws_1".into(),
            flow_id: flow_b.id.clone(),
            parent_subflow_id: None,
            name: "setup".into(),
            description: None,
            status: SubflowStatus::Started,
            result: None,
        };
        db.put_subflow(&subflow).unwrap();

        let mut action = FlowAction::new("ws_1", &flow_a.id, "edit");
        action.subflow_id = Some(subflow.id.clone());
        let err = db.create_flow_action(action).unwrap_err();
        assert!(matches!(err, StoreError::InvalidReference { .. }));
    }

    #[test]
    fn listing_orders_by_creation_and_pages_by_cursor() {
        let db = Database::in_memory();
        let flow = seed_flow(&db);
        let mut ids = Vec::new();
        for i in 0..5 {
            let action = db
                .create_flow_action(FlowAction::new("ws_1", &flow.id, format!("step_{i}")))
                .unwrap();
            ids.push(action.id);
        }

        let all = db.list_flow_actions(&flow.id, None, None).unwrap();
        assert_eq!(all.iter().map(|a| &a.id).collect::<Vec<_>>(), ids.iter().collect::<Vec<_>>());

        let page = db
            .list_flow_actions(&flow.id, Some(&ids[1]), Some(2))
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[2]);
        assert_eq!(page[1].id, ids[3]);
    }

    #[test]
    fn human_action_completion_validates_kind() {
        let db = Database::in_memory();
        let flow = seed_flow(&db);
        let action = db
            .create_flow_action(FlowAction::new("ws_1", &flow.id, "run_command"))
            .unwrap();
        let response = UserResponse {
            content: "lgtm".into(),
            approved: Some(true),
            choice: None,
            params: None,
        };
        let err = db.complete_human_action(&action.id, &response).unwrap_err();
        assert!(matches!(err, StoreError::NotHumanAction { .. }));

        let mut human = FlowAction::new("ws_1", &flow.id, "user_request");
        human.is_human_action = true;
        let human = db.create_flow_action(human).unwrap();
        let done = db.complete_human_action(&human.id, &response).unwrap();
        assert_eq!(done.action_status, ActionStatus::Complete);
        assert!(done.action_result.contains("lgtm"));
    }

    #[test]
    fn terminal_task_status_absorbs() {
        let db = Database::in_memory();
        let task = Task {
            id: crate::new_id("task"),
            workspace_id: "ws_1".into(),
            title: "t".into(),
            description: String::new(),
            status: TaskStatus::InProgress,
            flow_type: FlowType::BasicDev,
            agent_type: crate::model::AgentType::Llm,
            flow_options: Default::default(),
            created: Utc::now(),
            updated: Utc::now(),
            links: vec![],
        };
        db.put_task(&task).unwrap();
        db.set_task_status(&task.id, TaskStatus::Canceled).unwrap();
        let err = db
            .set_task_status(&task.id, TaskStatus::InProgress)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn topic_transcripts_append_in_order() {
        let db = Database::in_memory();
        let topic = Topic::new("ws_1", "task discussion");
        db.put_topic(&topic).unwrap();

        for (role, content) in [("user", "please fix the bug"), ("assistant", "on it")] {
            db.append_message(&Message::new("ws_1", &topic.id, role, content))
                .unwrap();
        }
        let messages = db.list_messages(&topic.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].content, "on it");

        // Messages need an existing topic.
        let err = db
            .append_message(&Message::new("ws_1", "topic_missing", "user", "hi"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "topic", .. }));
    }

    #[test]
    fn flow_event_log_round_trips_in_order() {
        let db = Database::in_memory();
        for seq in 0..3u64 {
            db.append_flow_event("flow_x", seq, &serde_json::json!({ "seq": seq }))
                .unwrap();
        }
        let events = db.list_flow_events("flow_x").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2]["seq"], 2);
    }
}
