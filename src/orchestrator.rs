//! The task & flow orchestrator: task lifecycle, flow spawning, user
//! signals, cancellation, and the query surface the HTTP layer exposes.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::flow::{FlowEngine, FlowInput, action_channel};
use crate::model::{
    ActionStatus, AgentType, Flow, FlowAction, FlowStatus, FlowType, Task, TaskStatus,
    UserResponse, Workspace,
};
use crate::store::{Database, StoreError};

/// Request body for task creation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub flow_type: FlowType,
    #[serde(default)]
    pub flow_options: IndexMap<String, Value>,
}

pub struct Orchestrator {
    db: Database,
    engine: Arc<FlowEngine>,
}

impl Orchestrator {
    pub fn new(db: Database, engine: Arc<FlowEngine>) -> Self {
        Self { db, engine }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    // =========================================================================
    // Workspaces
    // =========================================================================

    pub fn create_workspace(&self, name: &str, local_repo_dir: &str) -> anyhow::Result<Workspace> {
        if name.trim().is_empty() {
            bail!(StoreError::InvalidReference {
                message: "workspace name must not be empty".to_string(),
            });
        }
        if !Path::new(local_repo_dir).is_dir() {
            bail!(StoreError::InvalidReference {
                message: format!("localRepoDir does not exist: {local_repo_dir}"),
            });
        }
        let workspace = Workspace::new(name, local_repo_dir);
        self.db.put_workspace(&workspace)?;
        log::info!("created workspace {} for {}", workspace.id, local_repo_dir);
        Ok(workspace)
    }

    pub fn list_workspaces(&self) -> anyhow::Result<Vec<Workspace>> {
        Ok(self.db.list_workspaces()?)
    }

    // =========================================================================
    // Tasks & flows
    // =========================================================================

    /// Create a task and spawn its flow. The task passes through
    /// `drafting` while the flow is set up, then lands in `in_progress`.
    pub fn create_task(
        &self,
        workspace_id: &str,
        req: CreateTaskRequest,
    ) -> anyhow::Result<(Task, Vec<Flow>)> {
        let workspace = self.db.get_workspace(workspace_id)?;
        if req.title.trim().is_empty() {
            bail!(StoreError::InvalidReference {
                message: "task title must not be empty".to_string(),
            });
        }

        let now = chrono::Utc::now();
        let task = Task {
            id: crate::new_id("task"),
            workspace_id: workspace.id.clone(),
            title: req.title,
            description: req.description,
            status: TaskStatus::Drafting,
            flow_type: req.flow_type,
            agent_type: AgentType::Llm,
            flow_options: req.flow_options,
            created: now,
            updated: now,
            links: Vec::new(),
        };
        self.db.put_task(&task)?;

        // Each flow gets a conversation topic for its transcript.
        let topic = crate::model::Topic::new(&workspace.id, &task.title);
        self.db.put_topic(&topic)?;

        let flow = Flow {
            id: crate::new_id("flow"),
            workspace_id: workspace.id.clone(),
            parent_id: task.id.clone(),
            flow_type: task.flow_type,
            topic_id: Some(topic.id),
            status: FlowStatus::Started,
        };
        self.db.put_flow(&flow)?;

        let input = FlowInput::from_task(&workspace, &task);
        self.engine
            .start_flow(&flow, input)
            .context("starting flow")?;

        let task = self.db.set_task_status(&task.id, TaskStatus::InProgress)?;
        log::info!("task {} started flow {}", task.id, flow.id);
        Ok((task, vec![flow]))
    }

    pub fn get_task_with_flows(
        &self,
        workspace_id: &str,
        task_id: &str,
    ) -> anyhow::Result<(Task, Vec<Flow>)> {
        let task = self.db.get_task(task_id)?;
        ensure_workspace(workspace_id, &task.workspace_id, "task", task_id)?;
        let flows = self.db.flows_for_task(task_id)?;
        Ok((task, flows))
    }

    /// Cancel a task: broadcast cancellation to its non-terminal flows
    /// and move the task to `canceled`.
    pub fn cancel_task(&self, workspace_id: &str, task_id: &str) -> anyhow::Result<Task> {
        let task = self.db.get_task(task_id)?;
        ensure_workspace(workspace_id, &task.workspace_id, "task", task_id)?;
        for flow in self.db.flows_for_task(task_id)? {
            if !flow.status.is_terminal() {
                self.engine.cancel_flow(&flow.id);
            }
        }
        let task = match self.db.set_task_status(task_id, TaskStatus::Canceled) {
            Ok(task) => task,
            // Already terminal: cancellation of a settled task is a no-op.
            Err(StoreError::InvalidTransition { .. }) => task,
            Err(e) => return Err(e.into()),
        };
        Ok(task)
    }

    // =========================================================================
    // Flow actions
    // =========================================================================

    pub fn list_flow_actions(
        &self,
        workspace_id: &str,
        flow_id: &str,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<FlowAction>> {
        let flow = self.db.get_flow(flow_id)?;
        ensure_workspace(workspace_id, &flow.workspace_id, "flow", flow_id)?;
        Ok(self.db.list_flow_actions(flow_id, after, limit)?)
    }

    pub fn get_flow_action(&self, workspace_id: &str, action_id: &str) -> anyhow::Result<FlowAction> {
        let action = self.db.get_flow_action(action_id)?;
        ensure_workspace(workspace_id, &action.workspace_id, "flow action", action_id)?;
        Ok(action)
    }

    /// Complete a human action with the user's response and deliver the
    /// response into the flow on the action's signal channel.
    pub fn complete_flow_action(
        &self,
        workspace_id: &str,
        action_id: &str,
        response: UserResponse,
    ) -> anyhow::Result<FlowAction> {
        let action = self.db.get_flow_action(action_id)?;
        ensure_workspace(workspace_id, &action.workspace_id, "flow action", action_id)?;
        let action = self.db.complete_human_action(action_id, &response)?;
        self.engine.signal(
            &action.flow_id,
            &action_channel(action_id),
            serde_json::to_value(&response)?,
        );
        log::info!("flow action {action_id} completed by user");
        Ok(action)
    }

    /// Post a free-form user signal (e.g. `dev_run_start`) to a flow,
    /// recording it as a flow action.
    pub fn send_user_action(
        &self,
        workspace_id: &str,
        flow_id: &str,
        action_type: &str,
    ) -> anyhow::Result<FlowAction> {
        let flow = self.db.get_flow(flow_id)?;
        ensure_workspace(workspace_id, &flow.workspace_id, "flow", flow_id)?;
        if action_type.trim().is_empty() {
            bail!(StoreError::InvalidReference {
                message: "actionType must not be empty".to_string(),
            });
        }

        let mut action = FlowAction::new(workspace_id, flow_id, action_type);
        action.is_callback_action = true;
        let action = self.db.create_flow_action(action)?;
        self.db
            .transition_flow_action(&action.id, ActionStatus::Complete, None)?;
        self.engine.signal(
            flow_id,
            "user_action",
            serde_json::json!({ "actionType": action_type }),
        );
        Ok(action)
    }

    /// Synchronous query against a flow's state.
    pub fn query_flow(
        &self,
        workspace_id: &str,
        flow_id: &str,
        query: &str,
        args: Option<&Value>,
    ) -> anyhow::Result<Value> {
        let flow = self.db.get_flow(flow_id)?;
        ensure_workspace(workspace_id, &flow.workspace_id, "flow", flow_id)?;
        Ok(self.engine.query(flow_id, query, args)?)
    }
}

fn ensure_workspace(
    expected: &str,
    actual: &str,
    kind: &'static str,
    id: &str,
) -> Result<(), StoreError> {
    if expected != actual {
        // Cross-workspace access reads as absence, not as a permission
        // distinction.
        return Err(StoreError::NotFound {
            kind,
            id: id.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowEngine;

    fn orchestrator() -> Orchestrator {
        let db = Database::in_memory();
        let engine = FlowEngine::new(db.clone());
        Orchestrator::new(db, engine)
    }

    #[tokio::test]
    async fn workspace_requires_existing_repo_dir() {
        let orch = orchestrator();
        let err = orch
            .create_workspace("wk", "/definitely/not/a/dir")
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let dir = tempfile::tempdir().unwrap();
        let ws = orch
            .create_workspace("wk", dir.path().to_str().unwrap())
            .unwrap();
        assert_eq!(ws.name, "wk");
        assert_eq!(orch.list_workspaces().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn entities_are_scoped_to_their_workspace() {
        let orch = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let ws = orch
            .create_workspace("wk", dir.path().to_str().unwrap())
            .unwrap();

        let flow = Flow {
            id: crate::new_id("flow"),
            workspace_id: ws.id.clone(),
            parent_id: "task_x".into(),
            flow_type: FlowType::BasicDev,
            topic_id: None,
            status: FlowStatus::Started,
        };
        orch.db.put_flow(&flow).unwrap();

        let err = orch
            .list_flow_actions("ws_other", &flow.id, None, None)
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(orch.list_flow_actions(&ws.id, &flow.id, None, None).is_ok());
    }

    #[tokio::test]
    async fn user_actions_are_recorded_and_completed() {
        let orch = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let ws = orch
            .create_workspace("wk", dir.path().to_str().unwrap())
            .unwrap();
        let flow = Flow {
            id: crate::new_id("flow"),
            workspace_id: ws.id.clone(),
            parent_id: "task_x".into(),
            flow_type: FlowType::BasicDev,
            topic_id: None,
            status: FlowStatus::InProgress,
        };
        orch.db.put_flow(&flow).unwrap();

        let action = orch
            .send_user_action(&ws.id, &flow.id, "dev_run_start")
            .unwrap();
        let stored = orch.get_flow_action(&ws.id, &action.id).unwrap();
        assert_eq!(stored.action_status, ActionStatus::Complete);
        assert!(stored.is_callback_action);
    }

    #[tokio::test]
    async fn completing_a_non_human_action_is_rejected() {
        let orch = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let ws = orch
            .create_workspace("wk", dir.path().to_str().unwrap())
            .unwrap();
        let flow = Flow {
            id: crate::new_id("flow"),
            workspace_id: ws.id.clone(),
            parent_id: "task_x".into(),
            flow_type: FlowType::BasicDev,
            topic_id: None,
            status: FlowStatus::InProgress,
        };
        orch.db.put_flow(&flow).unwrap();
        let action = orch
            .db
            .create_flow_action(FlowAction::new(&ws.id, &flow.id, "run_command"))
            .unwrap();

        let response = UserResponse {
            content: String::new(),
            approved: Some(true),
            choice: None,
            params: None,
        };
        let err = orch
            .complete_flow_action(&ws.id, &action.id, response)
            .unwrap_err();
        assert!(err.to_string().contains("not a human action"));
    }
}
