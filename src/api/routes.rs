//! API route definitions.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::state::AppState;
use crate::dispatch::RunRequest;
use crate::error::{DispatchError, Result};
use crate::model::{Outcome, TestSuite, TestSuitePatch};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/scripts/{script}", get(fetch_script))
        .route("/suites", get(list_suites).post(register_suite))
        .route("/suites/{suite}", patch(patch_suite))
        .route("/suites/{suite}/run", post(submit_run))
        .route("/queues", get(list_queues).post(provision))
        .route("/queues/{endpoint}/claim", post(claim))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/complete", post(complete_task))
}

/// Unwrap a JSON body, reporting malformed input in the API error shape.
fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| DispatchError::validation("body", e.body_text()))
}

fn task_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| DispatchError::validation("task id", e.to_string()))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339()
        }
    }))
}

async fn fetch_script(State(state): State<AppState>, Path(script): Path<String>) -> Result<Response> {
    let artifact = state.packager.pack(&script).await?;
    let file = tokio::fs::File::open(artifact.path()).await?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name());
    let length = artifact.size();

    // The stream owns the artifact so its directory outlives the transfer.
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _ = &artifact;
        chunk
    });

    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn list_suites(State(state): State<AppState>) -> Result<Json<Value>> {
    let suites = state.dispatcher.list_suites().await?;
    Ok(Json(json!({ "data": suites, "meta": { "total": suites.len() } })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NewSuite {
    test_suite: String,
    test_cases: Option<Vec<String>>,
    parameters: Option<BTreeMap<String, String>>,
    path: Option<String>,
    author: Option<String>,
}

async fn register_suite(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NewSuite>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let req = body(payload)?;
    let mut suite = TestSuite::new(&req.test_suite)?;
    TestSuitePatch {
        test_cases: req.test_cases,
        parameters: req.parameters,
        path: req.path,
        author: req.author,
    }
    .apply(&mut suite)?;

    let suite = state.dispatcher.register_suite(suite).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": suite }))))
}

async fn patch_suite(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<TestSuitePatch>, JsonRejection>,
) -> Result<Json<Value>> {
    let suite = state.dispatcher.patch_suite(&name, body(payload)?).await?;
    Ok(Json(json!({ "data": suite })))
}

async fn submit_run(
    State(state): State<AppState>,
    Path(suite): Path<String>,
    payload: std::result::Result<Json<RunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let id = state.dispatcher.submit_run(&suite, body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": { "task_id": id } }))))
}

async fn list_queues(State(state): State<AppState>) -> Result<Json<Value>> {
    let queues = state.dispatcher.list_queues().await?;
    Ok(Json(json!({ "data": queues, "meta": { "total": queues.len() } })))
}

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    endpoint_address: String,
}

async fn provision(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let req = body(payload)?;
    let queue = state.dispatcher.provision(&req.endpoint_address).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": { "endpoint_address": queue.endpoint_address } })),
    ))
}

async fn claim(State(state): State<AppState>, Path(endpoint): Path<String>) -> Result<Response> {
    Ok(match state.dispatcher.claim(&endpoint).await? {
        Some(task) => Json(json!({ "data": task })).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let task = state.dispatcher.get_task(task_id(&id)?).await?;
    Ok(Json(json!({ "data": task })))
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    outcome: Outcome,
}

async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let req = body(payload)?;
    let task = state.dispatcher.complete(task_id(&id)?, req.outcome).await?;
    Ok(Json(json!({ "data": task })))
}
