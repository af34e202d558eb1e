//! Core records: workspaces, tasks, flows, subflows, flow actions,
//! worktrees.
//!
//! These are the durable shapes shared by the store, the flow engine and
//! the HTTP surface. References between entities are stored one-way by id
//! (task → workspace, flow → task, action → flow/subflow); traversal in
//! the other direction goes through [`crate::store::Database`].
//!
//! JSON field names are camelCase so the wire format matches the API
//! documentation; status enums serialize snake_case.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use svix_ksuid::{Ksuid, KsuidLike};

/// Mint a new ksuid-based id with an entity prefix, e.g. `task_2bMf…`.
///
/// Ksuids embed their creation time in the leading bytes, so ids created
/// later sort later; the stores lean on this for creation-ordered listing.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Ksuid::new(None, None))
}

/// A workspace: one local repository registered with sidekick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    /// Immutable after creation.
    pub local_repo_dir: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Provider configuration overrides; absent means process defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_config: Option<crate::embedding::EmbeddingModelConfig>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, local_repo_dir: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("ws"),
            name: name.into(),
            local_repo_dir: local_repo_dir.into(),
            created: now,
            updated: now,
            llm_config: None,
            embedding_config: None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Drafting,
    ToDo,
    InProgress,
    Blocked,
    Complete,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Terminal states absorb: once reached, no further transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlowType {
    BasicDev,
    PlannedDev,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentType {
    Human,
    Llm,
    None,
}

/// A unit of work requested by the user; executes as one or more flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub flow_type: FlowType,
    pub agent_type: AgentType,
    #[serde(default)]
    pub flow_options: IndexMap<String, serde_json::Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlowStatus {
    Started,
    InProgress,
    AwaitingHuman,
    Complete,
    Failed,
    Canceled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Complete | FlowStatus::Failed | FlowStatus::Canceled
        )
    }
}

/// One durable workflow instance, 1:1 with an engine execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub workspace_id: String,
    /// The owning task's id.
    pub parent_id: String,
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    pub status: FlowStatus,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubflowStatus {
    Started,
    InProgress,
    Complete,
    Failed,
}

impl SubflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubflowStatus::Complete | SubflowStatus::Failed)
    }
}

/// A named logical phase within a flow. Subflows form a forest rooted at
/// the flow; `parent_subflow_id` mirrors the call tree of phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subflow {
    pub id: String,
    pub workspace_id: String,
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_subflow_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: SubflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Started,
    Complete,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Complete | ActionStatus::Failed)
    }

    /// The only legal order is `pending → started → (complete|failed)`,
    /// with `pending → (complete|failed)` allowed as a short-circuit.
    pub fn can_transition_to(self, next: ActionStatus) -> bool {
        match (self, next) {
            (ActionStatus::Pending, ActionStatus::Started) => true,
            (ActionStatus::Pending | ActionStatus::Started, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

/// A recorded observable step of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowAction {
    pub id: String,
    pub workspace_id: String,
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow_id: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub action_type: String,
    #[serde(default)]
    pub action_params: IndexMap<String, serde_json::Value>,
    pub action_status: ActionStatus,
    #[serde(default)]
    pub action_result: String,
    pub is_human_action: bool,
    pub is_callback_action: bool,
}

impl FlowAction {
    pub fn new(
        workspace_id: impl Into<String>,
        flow_id: impl Into<String>,
        action_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("fa"),
            workspace_id: workspace_id.into(),
            flow_id: flow_id.into(),
            subflow_id: None,
            created: now,
            updated: now,
            action_type: action_type.into(),
            action_params: IndexMap::new(),
            action_status: ActionStatus::Pending,
            action_result: String::new(),
            is_human_action: false,
            is_callback_action: false,
        }
    }
}

/// A user's response completing a human flow action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<IndexMap<String, serde_json::Value>>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TopicStatus {
    Started,
    Complete,
}

/// A conversation transcript attached to a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub title: String,
    pub status: TopicStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Topic {
    pub fn new(workspace_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("topic"),
            workspace_id: workspace_id.into(),
            title: title.into(),
            status: TopicStatus::Started,
            created: now,
            updated: now,
        }
    }
}

/// One message appended to a topic's transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub workspace_id: String,
    pub topic_id: String,
    pub role: String,
    pub content: String,
    pub status: TopicStatus,
    pub created: DateTime<Utc>,
}

impl Message {
    pub fn new(
        workspace_id: impl Into<String>,
        topic_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id("msg"),
            workspace_id: workspace_id.into(),
            topic_id: topic_id.into(),
            role: role.into(),
            content: content.into(),
            status: TopicStatus::Complete,
            created: Utc::now(),
        }
    }
}

/// A git worktree owned by a flow. Branch name and worktree name are the
/// same; `path` is absolute and symlink-resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
    pub id: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Doubles as the branch name.
    pub name: String,
    pub path: String,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_sort_by_creation() {
        let a = new_id("task");
        let b = new_id("task");
        assert!(a.starts_with("task_"));
        // Ksuids with the same timestamp second may tie on the prefix but
        // never collide outright.
        assert_ne!(a, b);
    }

    #[test]
    fn action_status_edges() {
        use ActionStatus::*;
        assert!(Pending.can_transition_to(Started));
        assert!(Pending.can_transition_to(Complete));
        assert!(Started.can_transition_to(Failed));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Started.can_transition_to(Pending));
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&FlowType::BasicDev).unwrap(),
            "\"basic_dev\""
        );
        assert_eq!(TaskStatus::ToDo.to_string(), "to_do");
    }

    #[test]
    fn terminal_statuses_absorb() {
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(FlowStatus::Failed.is_terminal());
        assert!(!FlowStatus::AwaitingHuman.is_terminal());
        assert!(SubflowStatus::Complete.is_terminal());
    }
}
