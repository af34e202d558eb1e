//! HTTP client for the sidekick API, used by the CLI.
//!
//! Any status outside 2xx is a failure; the server's JSON `error` field
//! is surfaced when present, the raw body otherwise.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::model::{Flow, FlowAction, FlowType, Task, UserResponse, Workspace};

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

/// A task with its flows embedded, as returned by the task endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskWithFlows {
    #[serde(flatten)]
    pub task: Task,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> anyhow::Result<T> {
        let url = format!("{}/api/v1{}", self.base_url, path);
        let mut req = self.http.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let response = req.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        if !(200..=299).contains(&status) {
            // Prefer the structured error field; fall back to the body.
            let message = serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            anyhow::bail!("{url} returned {status}: {message}");
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn create_workspace(
        &self,
        name: &str,
        local_repo_dir: &str,
    ) -> anyhow::Result<Workspace> {
        #[derive(Deserialize)]
        struct Wrapper {
            workspace: Workspace,
        }
        let wrapper: Wrapper = self
            .request(
                reqwest::Method::POST,
                "/workspaces",
                Some(json!({ "name": name, "localRepoDir": local_repo_dir })),
            )
            .await?;
        Ok(wrapper.workspace)
    }

    pub async fn list_workspaces(&self) -> anyhow::Result<Vec<Workspace>> {
        #[derive(Deserialize)]
        struct Wrapper {
            workspaces: Vec<Workspace>,
        }
        let wrapper: Wrapper = self
            .request(reqwest::Method::GET, "/workspaces", None)
            .await?;
        Ok(wrapper.workspaces)
    }

    pub async fn create_task(
        &self,
        workspace_id: &str,
        title: &str,
        description: &str,
        flow_type: FlowType,
        flow_options: IndexMap<String, Value>,
    ) -> anyhow::Result<TaskWithFlows> {
        #[derive(Deserialize)]
        struct Wrapper {
            task: TaskWithFlows,
        }
        let wrapper: Wrapper = self
            .request(
                reqwest::Method::POST,
                &format!("/workspaces/{workspace_id}/tasks"),
                Some(json!({
                    "title": title,
                    "description": description,
                    "flowType": flow_type,
                    "flowOptions": flow_options,
                })),
            )
            .await?;
        Ok(wrapper.task)
    }

    pub async fn get_task(
        &self,
        workspace_id: &str,
        task_id: &str,
    ) -> anyhow::Result<TaskWithFlows> {
        #[derive(Deserialize)]
        struct Wrapper {
            task: TaskWithFlows,
        }
        let wrapper: Wrapper = self
            .request(
                reqwest::Method::GET,
                &format!("/workspaces/{workspace_id}/tasks/{task_id}"),
                None,
            )
            .await?;
        Ok(wrapper.task)
    }

    pub async fn cancel_task(&self, workspace_id: &str, task_id: &str) -> anyhow::Result<Task> {
        #[derive(Deserialize)]
        struct Wrapper {
            task: Task,
        }
        let wrapper: Wrapper = self
            .request(
                reqwest::Method::POST,
                &format!("/workspaces/{workspace_id}/tasks/{task_id}/cancel"),
                Some(json!({})),
            )
            .await?;
        Ok(wrapper.task)
    }

    pub async fn list_flow_actions(
        &self,
        workspace_id: &str,
        flow_id: &str,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<FlowAction>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Wrapper {
            flow_actions: Vec<FlowAction>,
        }
        let mut path = format!("/workspaces/{workspace_id}/flows/{flow_id}/flow_actions");
        let mut params = Vec::new();
        if let Some(after) = after {
            params.push(format!("after={after}"));
        }
        if let Some(limit) = limit {
            params.push(format!("limit={limit}"));
        }
        if !params.is_empty() {
            path = format!("{path}?{}", params.join("&"));
        }
        let wrapper: Wrapper = self.request(reqwest::Method::GET, &path, None).await?;
        Ok(wrapper.flow_actions)
    }

    pub async fn complete_flow_action(
        &self,
        workspace_id: &str,
        action_id: &str,
        response: &UserResponse,
    ) -> anyhow::Result<FlowAction> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Wrapper {
            flow_action: FlowAction,
        }
        let wrapper: Wrapper = self
            .request(
                reqwest::Method::POST,
                &format!("/workspaces/{workspace_id}/flow_actions/{action_id}/complete"),
                Some(json!({ "userResponse": response })),
            )
            .await?;
        Ok(wrapper.flow_action)
    }

    pub async fn send_user_action(
        &self,
        workspace_id: &str,
        flow_id: &str,
        action_type: &str,
    ) -> anyhow::Result<FlowAction> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Wrapper {
            flow_action: FlowAction,
        }
        let wrapper: Wrapper = self
            .request(
                reqwest::Method::POST,
                &format!("/workspaces/{workspace_id}/flows/{flow_id}/user_action"),
                Some(json!({ "actionType": action_type })),
            )
            .await?;
        Ok(wrapper.flow_action)
    }

    pub async fn query_flow(
        &self,
        workspace_id: &str,
        flow_id: &str,
        query: &str,
        args: Option<Value>,
    ) -> anyhow::Result<Value> {
        #[derive(Deserialize)]
        struct Wrapper {
            result: Value,
        }
        let wrapper: Wrapper = self
            .request(
                reqwest::Method::POST,
                &format!("/workspaces/{workspace_id}/flows/{flow_id}/query"),
                Some(json!({ "query": query, "args": args })),
            )
            .await?;
        Ok(wrapper.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = ApiClient::new("http://localhost:8855/");
        assert_eq!(client.base_url, "http://localhost:8855");
    }

    #[test]
    fn task_with_flows_deserializes_embedded_flows() {
        let value = json!({
            "id": "task_1",
            "workspaceId": "ws_1",
            "title": "t",
            "status": "in_progress",
            "flowType": "basic_dev",
            "agentType": "llm",
            "created": "2024-01-01T12:00:00Z",
            "updated": "2024-01-01T12:00:00Z",
            "flows": [{
                "id": "flow_1",
                "workspaceId": "ws_1",
                "parentId": "task_1",
                "type": "basic_dev",
                "status": "started"
            }]
        });
        let task: TaskWithFlows = serde_json::from_value(value).unwrap();
        assert_eq!(task.task.id, "task_1");
        assert_eq!(task.flows.len(), 1);
        assert_eq!(task.flows[0].parent_id, "task_1");
    }
}
