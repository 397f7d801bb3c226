//! HTTP route handlers for the task lifecycle and the memory log.
//!
//! Orchestrator calls touch the filesystem and spawn subprocesses, so every
//! one of them runs on the blocking pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use orchestrator::core::types::{Plan, Task};
use orchestrator::io::memory_log::{MemoryItem, MemoryLog, MemoryQuery, NewMemoryItem};
use orchestrator::orchestrator::{ReviewOutcome, ReviewPacket, RunOverrides};
use orchestrator::{Error as OrchestratorError, ErrorKind, Orchestrator};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::review_page;
use crate::sse;
use crate::state::{AppState, TaskEvent};

const NO_REVIEW_MESSAGE: &str = "No review available for this task yet.";

/// Build the full router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/plan", post(propose_plan))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/plan", put(submit_plan))
        .route("/tasks/{id}/approve_plan", post(approve_plan))
        .route("/tasks/{id}/execute_plan", post(execute_plan))
        .route("/tasks/{id}/execute", post(execute))
        .route("/tasks/{id}/request_review", post(request_review))
        .route("/tasks/{id}/review", get(show_review).post(submit_review))
        .route("/tasks/{id}/approve_patch", post(approve_patch))
        .route("/tasks/{id}/feedback", post(submit_feedback))
        .route("/tasks/{id}/fail", post(fail_task))
        .route("/memory/upsert", post(upsert_memory))
        .route("/memory/query", get(query_memory))
        .route("/events", get(sse::events_handler))
        .with_state(state)
}

/// Run `work` on the blocking pool. The outer error is a panicked worker.
async fn run_blocking<T, F>(state: &AppState, work: F) -> Result<orchestrator::Result<T>, ApiError>
where
    F: FnOnce(&Orchestrator) -> orchestrator::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let orchestrator = Arc::clone(&state.orchestrator);
    Ok(tokio::task::spawn_blocking(move || work(&orchestrator)).await?)
}

async fn blocking<T, F>(state: &AppState, work: F) -> Result<T, ApiError>
where
    F: FnOnce(&Orchestrator) -> orchestrator::Result<T> + Send + 'static,
    T: Send + 'static,
{
    run_blocking(state, work).await?.map_err(ApiError::from)
}

async fn with_memory<T, F>(state: &AppState, work: F) -> Result<T, ApiError>
where
    F: FnOnce(&MemoryLog) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::task::spawn_blocking(move || match orchestrator.memory() {
        Some(memory) => work(memory).map_err(ApiError::from),
        None => Err(ApiError::not_found("memory log is disabled in config")),
    })
    .await?
}

/// Parse a JSON body that must be present.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::bad_request("request body is required"));
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))
}

/// Parse a JSON body, treating an empty one as all defaults.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

fn required(field: &'static str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(
            ApiError::bad_request(format!("invalid {field}: must be non-empty"))
                .with_detail("field", field),
        );
    }
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let gate = state.orchestrator.gate();
    Json(json!({
        "status": "ok",
        "active_executions": gate.active(),
        "concurrency_limit": gate.limit(),
    }))
}

/// GET /tasks
async fn list_tasks(State(state): State<AppState>) -> Json<Vec<Task>> {
    Json(state.orchestrator.list_tasks())
}

/// GET /tasks/{id}
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.get_task(&id)?))
}

#[derive(Debug, Default, Deserialize)]
struct CreateTaskRequest {
    #[serde(default)]
    id: Option<String>,
}

/// POST /tasks
async fn create_task(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let request: CreateTaskRequest = optional_body(&body)?;
    let task = blocking(&state, move |orch| orch.create_task(request.id.as_deref())).await?;
    state.publish_created(&task);
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Default, Deserialize)]
struct PlanRequest {
    #[serde(default)]
    requirement: String,
    #[serde(default)]
    context: Option<String>,
}

/// POST /tasks/plan - create a task with a generated plan.
async fn propose_plan(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let request: PlanRequest = optional_body(&body)?;
    let outcome = run_blocking(&state, move |orch| {
        orch.propose_plan(&request.requirement, request.context.as_deref())
    })
    .await?;
    let task = match outcome {
        Ok(task) => task,
        Err(err) => {
            // The task was created before planning failed and now sits in ERROR.
            if let OrchestratorError::PlanProvider { task_id, .. } = &err
                && let Ok(task) = state.orchestrator.get_task(task_id)
            {
                state.publish_created(&task);
            }
            return Err(err.into());
        }
    };
    state.publish_created(&task);
    info!(task_id = %task.id, "plan generated");
    Ok((StatusCode::CREATED, Json(task)))
}

/// PUT /tasks/{id}/plan
async fn submit_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Task>, ApiError> {
    let plan: Plan = parse_body(&body)?;
    let task = blocking(&state, move |orch| orch.submit_plan(&id, plan)).await?;
    state.publish_status(&task);
    Ok(Json(task))
}

#[derive(Debug, Default, Deserialize)]
struct ApprovePlanRequest {
    #[serde(default)]
    feedback: Option<String>,
}

/// POST /tasks/{id}/approve_plan
async fn approve_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Task>, ApiError> {
    let request: ApprovePlanRequest = optional_body(&body)?;
    let task = blocking(&state, move |orch| orch.approve_plan(&id, request.feedback)).await?;
    state.publish_status(&task);
    Ok(Json(task))
}

#[derive(Debug, Default, Deserialize)]
struct ExecutePlanRequest {
    /// File bodies keyed by plan step path.
    #[serde(default)]
    contents: BTreeMap<String, String>,
}

/// POST /tasks/{id}/execute_plan
async fn execute_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Task>, ApiError> {
    let request: ExecutePlanRequest = optional_body(&body)?;
    let task = blocking(&state, move |orch| orch.execute_plan(&id, &request.contents)).await?;
    state.publish_status(&task);
    Ok(Json(task))
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    command: String,
    #[serde(flatten)]
    overrides: RunOverrides,
}

/// POST /tasks/{id}/execute - run a test command in the task's workspace.
async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: ExecuteRequest = optional_body(&body)?;
    state.orchestrator.get_task(&id)?;

    let gate = state.orchestrator.gate();
    if gate.is_saturated() {
        warn!(task_id = %id, "execution gate saturated, refusing command");
        return Err(ApiError::saturated(gate.active(), gate.limit()));
    }

    let task_id = id.clone();
    let outcome = run_blocking(&state, move |orch| {
        orch.run_test(&task_id, &request.command, request.overrides)
    })
    .await?;

    match outcome {
        Ok(test_run) => {
            state.publish(TaskEvent::ExecutionRecorded {
                task_id: id.clone(),
                success: true,
            });
            Ok(Json(json!({
                "task_id": id,
                "result": test_run.run,
                "task": test_run.task,
            })))
        }
        Err(err) => {
            // Commands that ran were recorded on the task even though they failed.
            if matches!(err.kind(), ErrorKind::Timeout | ErrorKind::Execution) {
                state.publish(TaskEvent::ExecutionRecorded {
                    task_id: id,
                    success: false,
                });
            }
            Err(err.into())
        }
    }
}

/// POST /tasks/{id}/request_review
async fn request_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReviewPacket>, ApiError> {
    let packet = blocking(&state, move |orch| orch.request_review(&id)).await?;
    state.publish_status(&packet.task);
    Ok(Json(packet))
}

#[derive(Debug, Default, Deserialize)]
struct ReviewRequest {
    #[serde(default, alias = "diffContent")]
    diff: String,
}

/// POST /tasks/{id}/review - lint a diff. A rejected diff is recorded and
/// answered with 400 and the violations.
async fn submit_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ReviewOutcome>, ApiError> {
    let request: ReviewRequest = optional_body(&body)?;
    let task_id = id.clone();
    let outcome = blocking(&state, move |orch| orch.submit_review(&task_id, &request.diff)).await?;
    state.publish(TaskEvent::ReviewRecorded {
        task_id: id.clone(),
        valid: outcome.valid,
    });

    if !outcome.valid {
        return Err(
            ApiError::new(StatusCode::BAD_REQUEST, "violations", "rules violation")
                .with_detail("task_id", id)
                .with_detail("violations", outcome.violations),
        );
    }
    Ok(Json(outcome))
}

/// GET /tasks/{id}/review - HTML view of the latest review.
async fn show_review(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let rendered = match state.orchestrator.latest_review(&id) {
        Ok(Some(review)) => review_page::render_review(
            &state.templates,
            &id,
            &review.diff,
            review.valid,
            &review.violations,
        )
        .map(|html| (StatusCode::OK, html)),
        Ok(None) => review_page::render_missing(&state.templates, &id, NO_REVIEW_MESSAGE)
            .map(|html| (StatusCode::NOT_FOUND, html)),
        Err(err) => review_page::render_missing(&state.templates, &id, &err.to_string())
            .map(|html| (StatusCode::NOT_FOUND, html)),
    };

    match rendered {
        Ok((status, html)) => (status, Html(html)).into_response(),
        Err(err) => {
            warn!(task_id = %id, err = %err, "failed to render review page");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to render review page",
            )
                .into_response()
        }
    }
}

/// POST /tasks/{id}/approve_patch
async fn approve_patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task = blocking(&state, move |orch| orch.approve_patch(&id)).await?;
    state.publish_status(&task);
    Ok(Json(task))
}

#[derive(Debug, Default, Deserialize)]
struct FeedbackRequest {
    #[serde(default)]
    feedback: String,
}

/// POST /tasks/{id}/feedback
async fn submit_feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Task>, ApiError> {
    let request: FeedbackRequest = optional_body(&body)?;
    required("feedback", &request.feedback)?;
    let task = blocking(&state, move |orch| orch.submit_feedback(&id, &request.feedback)).await?;
    state.publish_status(&task);
    Ok(Json(task))
}

#[derive(Debug, Default, Deserialize)]
struct FailRequest {
    #[serde(default)]
    reason: String,
}

/// POST /tasks/{id}/fail
async fn fail_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Task>, ApiError> {
    let request: FailRequest = optional_body(&body)?;
    let task = blocking(&state, move |orch| orch.fail_task(&id, &request.reason)).await?;
    state.publish_status(&task);
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct UpsertRequest {
    item: NewMemoryItem,
}

/// POST /memory/upsert
async fn upsert_memory(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<MemoryItem>), ApiError> {
    let request: UpsertRequest = parse_body(&body)?;
    required("statement", &request.item.statement)?;
    let item = with_memory(&state, move |memory| memory.upsert(request.item)).await?;
    state.publish(TaskEvent::MemoryUpdated {
        id: item.id.clone(),
    });
    info!(id = %item.id, "memory item upserted");
    Ok((StatusCode::CREATED, Json(item)))
}

#[derive(Debug, Deserialize)]
struct MemoryQueryParams {
    q: Option<String>,
    /// Comma-separated.
    tags: Option<String>,
}

/// GET /memory/query?q=...&tags=a,b
async fn query_memory(
    State(state): State<AppState>,
    Query(params): Query<MemoryQueryParams>,
) -> Result<Json<Vec<MemoryItem>>, ApiError> {
    let keyword = params.q.filter(|q| !q.trim().is_empty());
    let tags: Vec<String> = params
        .tags
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if keyword.is_none() && tags.is_empty() {
        return Err(ApiError::bad_request(
            "a query parameter \"q\" or \"tags\" is required",
        ));
    }

    let query = MemoryQuery { keyword, tags };
    let items = with_memory(&state, move |memory| memory.query(&query)).await?;
    info!(results = items.len(), "memory query performed");
    Ok(Json(items))
}
