//! HTTP surface tests: route wiring, JSON shapes, and the error-status
//! mapping, driven through the router without a socket.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestRepo;
use sidekick::flow::FlowEngine;
use sidekick::orchestrator::Orchestrator;
use sidekick::server;
use sidekick::store::Database;
use serde_json::{Value, json};
use tower::ServiceExt;

fn app() -> (TestRepo, Router) {
    let repo = TestRepo::new();
    let db = Database::in_memory();
    let engine = FlowEngine::new(db.clone());
    let orchestrator = Arc::new(Orchestrator::new(db, engine));
    (repo, server::router(orchestrator))
}

async fn send(app: &Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let request = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            builder.body(Body::from(body.to_string())).unwrap()
        }
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn workspace_creation_and_listing() {
    let (repo, app) = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/workspaces",
        Some(json!({ "name": "wk", "localRepoDir": repo.path().to_str().unwrap() })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["workspace"]["id"].as_str().unwrap();
    assert!(id.starts_with("ws_"));
    assert_eq!(body["workspace"]["name"], "wk");

    let (status, body) = send(&app, "GET", "/api/v1/workspaces", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workspaces"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn bad_workspace_request_maps_to_400() {
    let (_repo, app) = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/workspaces",
        Some(json!({ "name": "wk", "localRepoDir": "/not/a/real/dir" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("does not exist"));
}

#[tokio::test]
async fn missing_entities_map_to_404() {
    let (_repo, app) = app();
    let (status, body) = send(&app, "GET", "/api/v1/workspaces/ws_x/tasks/task_x", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().is_some());

    let (status, _) = send(
        &app,
        "GET",
        "/api/v1/workspaces/ws_x/flow_actions/fa_x",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn task_lifecycle_over_http() {
    let (repo, app) = app();
    let base = tempfile::tempdir().unwrap();

    let (_, body) = send(
        &app,
        "POST",
        "/api/v1/workspaces",
        Some(json!({ "name": "wk", "localRepoDir": repo.path().to_str().unwrap() })),
    )
    .await;
    let ws = body["workspace"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/workspaces/{ws}/tasks"),
        Some(json!({
            "title": "t",
            "description": "d",
            "flowType": "basic_dev",
            "flowOptions": {
                "worktreeBaseDir": base.path().to_str().unwrap(),
                "targetBranch": "main"
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = body["task"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["task"]["status"], "in_progress");
    let flows = body["task"]["flows"].as_array().unwrap();
    assert_eq!(flows.len(), 1);
    let flow_id = flows[0]["id"].as_str().unwrap().to_string();

    // The flow parks on merge approval; find it through the actions list.
    let mut approval_id = None;
    for _ in 0..300 {
        let (_, body) = send(
            &app,
            "GET",
            &format!("/api/v1/workspaces/{ws}/flows/{flow_id}/flow_actions"),
            None,
        )
        .await;
        if let Some(action) = body["flowActions"].as_array().and_then(|actions| {
            actions
                .iter()
                .find(|a| a["actionType"] == "merge_approval" && a["actionStatus"] == "pending")
        }) {
            approval_id = Some(action["id"].as_str().unwrap().to_string());
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    let approval_id = approval_id.expect("merge approval never appeared");

    // Completing a human action twice: first 2xx, then a 400.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/workspaces/{ws}/flow_actions/{approval_id}/complete"),
        Some(json!({ "userResponse": { "content": "", "approved": true } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/workspaces/{ws}/flow_actions/{approval_id}/complete"),
        Some(json!({ "userResponse": { "content": "", "approved": false } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The task settles to complete.
    for _ in 0..300 {
        let (_, body) = send(
            &app,
            "GET",
            &format!("/api/v1/workspaces/{ws}/tasks/{task_id}"),
            None,
        )
        .await;
        if body["task"]["status"] == "complete" {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("task never completed");
}

#[tokio::test(flavor = "multi_thread")]
async fn user_actions_and_queries_round_trip() {
    let (repo, app) = app();
    let base = tempfile::tempdir().unwrap();
    let (_, body) = send(
        &app,
        "POST",
        "/api/v1/workspaces",
        Some(json!({ "name": "wk", "localRepoDir": repo.path().to_str().unwrap() })),
    )
    .await;
    let ws = body["workspace"]["id"].as_str().unwrap().to_string();
    let (_, body) = send(
        &app,
        "POST",
        &format!("/api/v1/workspaces/{ws}/tasks"),
        Some(json!({
            "title": "t",
            "flowType": "basic_dev",
            "flowOptions": {
                "worktreeBaseDir": base.path().to_str().unwrap(),
                "targetBranch": "main"
            }
        })),
    )
    .await;
    let flow_id = body["task"]["flows"][0]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/workspaces/{ws}/flows/{flow_id}/user_action"),
        Some(json!({ "actionType": "dev_run_start" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["flowAction"]["actionType"], "dev_run_start");
    assert_eq!(body["flowAction"]["actionStatus"], "complete");

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/workspaces/{ws}/flows/{flow_id}/query"),
        Some(json!({ "query": "status" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["result"].is_string());
}
