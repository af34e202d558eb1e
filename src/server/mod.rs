//! The HTTP surface: a thin axum router over the orchestrator.
//!
//! All routes are JSON under `/api/v1`. Handlers marshal; the
//! orchestrator decides. Error mapping follows the error taxonomy:
//! precondition violations are 4xx, absences are 404, everything else
//! is a 500 carrying `{"error": …}`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::git::GitError;
use crate::model::UserResponse;
use crate::orchestrator::{CreateTaskRequest, Orchestrator};
use crate::store::StoreError;

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route(
            "/api/v1/workspaces",
            post(create_workspace).get(list_workspaces),
        )
        .route("/api/v1/workspaces/:ws/tasks", post(create_task))
        .route("/api/v1/workspaces/:ws/tasks/:id", get(get_task))
        .route("/api/v1/workspaces/:ws/tasks/:id/cancel", post(cancel_task))
        .route(
            "/api/v1/workspaces/:ws/flows/:id/flow_actions",
            get(list_flow_actions),
        )
        .route(
            "/api/v1/workspaces/:ws/flow_actions/:id",
            get(get_flow_action),
        )
        .route(
            "/api/v1/workspaces/:ws/flow_actions/:id/complete",
            post(complete_flow_action),
        )
        .route(
            "/api/v1/workspaces/:ws/flows/:id/user_action",
            post(user_action),
        )
        .route("/api/v1/workspaces/:ws/flows/:id/query", post(query_flow))
        .with_state(orchestrator)
}

/// An error response: status code plus `{"error": message}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = classify(&err);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("request failed: {err:#}");
        }
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

fn classify(err: &anyhow::Error) -> StatusCode {
    for cause in err.chain() {
        if let Some(store_err) = cause.downcast_ref::<StoreError>() {
            return match store_err {
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                e if e.is_precondition() => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if let Some(git_err) = cause.downcast_ref::<GitError>()
            && git_err.is_precondition()
        {
            return StatusCode::BAD_REQUEST;
        }
    }
    StatusCode::INTERNAL_SERVER_ERROR
}

type ApiResult = Result<Response, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkspaceRequest {
    name: String,
    local_repo_dir: String,
}

async fn create_workspace(
    State(orch): State<Arc<Orchestrator>>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> ApiResult {
    let workspace = orch.create_workspace(&req.name, &req.local_repo_dir)?;
    Ok((StatusCode::CREATED, Json(json!({ "workspace": workspace }))).into_response())
}

async fn list_workspaces(State(orch): State<Arc<Orchestrator>>) -> ApiResult {
    let workspaces = orch.list_workspaces()?;
    Ok(Json(json!({ "workspaces": workspaces })).into_response())
}

async fn create_task(
    State(orch): State<Arc<Orchestrator>>,
    Path(ws): Path<String>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult {
    let (task, flows) = orch.create_task(&ws, req)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "task": task_with_flows(&task, &flows)? })),
    )
        .into_response())
}

async fn get_task(
    State(orch): State<Arc<Orchestrator>>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult {
    let (task, flows) = orch.get_task_with_flows(&ws, &id)?;
    Ok(Json(json!({ "task": task_with_flows(&task, &flows)? })).into_response())
}

/// The task JSON with its flows embedded, as the API documents it.
fn task_with_flows(
    task: &crate::model::Task,
    flows: &[crate::model::Flow],
) -> Result<Value, ApiError> {
    let mut value = serde_json::to_value(task).map_err(anyhow::Error::from)?;
    value["flows"] = serde_json::to_value(flows).map_err(anyhow::Error::from)?;
    Ok(value)
}

async fn cancel_task(
    State(orch): State<Arc<Orchestrator>>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult {
    let task = orch.cancel_task(&ws, &id)?;
    Ok(Json(json!({ "task": task })).into_response())
}

async fn list_flow_actions(
    State(orch): State<Arc<Orchestrator>>,
    Path((ws, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let after = params.get("after").map(String::as_str);
    let limit = params.get("limit").and_then(|l| l.parse().ok());
    let actions = orch.list_flow_actions(&ws, &id, after, limit)?;
    Ok(Json(json!({ "flowActions": actions })).into_response())
}

async fn get_flow_action(
    State(orch): State<Arc<Orchestrator>>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult {
    let action = orch.get_flow_action(&ws, &id)?;
    Ok(Json(json!({ "flowAction": action })).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteActionRequest {
    user_response: UserResponse,
}

async fn complete_flow_action(
    State(orch): State<Arc<Orchestrator>>,
    Path((ws, id)): Path<(String, String)>,
    Json(req): Json<CompleteActionRequest>,
) -> ApiResult {
    let action = orch.complete_flow_action(&ws, &id, req.user_response)?;
    Ok(Json(json!({ "flowAction": action })).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserActionRequest {
    action_type: String,
}

async fn user_action(
    State(orch): State<Arc<Orchestrator>>,
    Path((ws, id)): Path<(String, String)>,
    Json(req): Json<UserActionRequest>,
) -> ApiResult {
    let action = orch.send_user_action(&ws, &id, &req.action_type)?;
    Ok(Json(json!({ "flowAction": action })).into_response())
}

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    args: Option<Value>,
}

async fn query_flow(
    State(orch): State<Arc<Orchestrator>>,
    Path((ws, id)): Path<(String, String)>,
    Json(req): Json<QueryRequest>,
) -> ApiResult {
    let result = orch.query_flow(&ws, &id, &req.query, req.args.as_ref())?;
    Ok(Json(json!({ "result": result })).into_response())
}
