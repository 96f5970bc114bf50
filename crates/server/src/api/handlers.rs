use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use flowkeel_core::{Run, RunId, RunSnapshot, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid run ID: {}", raw)))
}

/// Register a workflow definition
pub async fn register_workflow(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<WorkflowDefinition>,
) -> ApiResult<(StatusCode, Json<RegisterWorkflowResponse>)> {
    let slug = definition.slug.to_string();
    let created = state.engine.register_workflow(definition)?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(RegisterWorkflowResponse { slug, created })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterWorkflowResponse {
    pub slug: String,
    /// False when an identical definition was already registered
    pub created: bool,
}

/// List registered workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state.engine.list_workflows()?;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowDefinition>,
}

/// Get a workflow definition
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let workflow = state
        .engine
        .workflow(&slug)?
        .ok_or_else(|| ApiError::not_found(format!("Workflow not found: {}", slug)))?;
    Ok(Json(workflow))
}

/// Start a run of a registered workflow
pub async fn submit_run(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(req): Json<SubmitRunRequest>,
) -> ApiResult<(StatusCode, Json<SubmitRunResponse>)> {
    let run_id = state.engine.submit(&slug, req.input)?;
    tracing::info!("Submitted run {} of workflow {}", run_id, slug);
    Ok((StatusCode::CREATED, Json(SubmitRunResponse { run_id })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRunRequest {
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRunResponse {
    pub run_id: RunId,
}

/// List runs, newest first
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<ListRunsResponse>> {
    let runs = state.engine.list_runs(query.workflow.as_deref())?;
    Ok(Json(ListRunsResponse { runs }))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub workflow: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

/// Get a run with its steps and tasks
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSnapshot>> {
    let run_id = parse_run_id(&run_id)?;
    let snapshot = state
        .engine
        .get_run(&run_id)?
        .ok_or_else(|| ApiError::not_found(format!("Run not found: {}", run_id)))?;
    Ok(Json(snapshot))
}

/// Cancel a running run
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<CancelRunResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let cancelled = state.engine.cancel_run(&run_id)?;
    Ok(Json(CancelRunResponse { run_id, cancelled }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelRunResponse {
    pub run_id: RunId,
    /// False when the run had already finished
    pub cancelled: bool,
}
