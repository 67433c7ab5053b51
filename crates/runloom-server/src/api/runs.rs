// Run lifecycle endpoints: start, inspect, pause/resume/cancel

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use runloom_engine::{Envelope, RetryPolicy, Run, Step, WorkflowStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::RequireAuth;
use crate::AppState;

use super::common::ApiError;

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    /// Explicit run id for idempotent submission; generated when omitted
    pub run_id: Option<Uuid>,
    pub workflow_id: Uuid,
    pub workflow_version_id: Option<Uuid>,
    pub trigger_id: Option<Uuid>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub variables: Option<Value>,
    pub timeout_seconds: Option<i64>,
    pub retry_policy: Option<RetryPolicy>,
}

pub async fn start(
    State(state): State<AppState>,
    _auth: RequireAuth,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let mut run = Run::new(
        req.workflow_id,
        req.input.map(Envelope::from_value).unwrap_or_default(),
    );
    if let Some(run_id) = req.run_id {
        run.id = run_id;
    }
    run.workflow_version_id = req.workflow_version_id;
    run.trigger_id = req.trigger_id;
    run.variables = req.variables.map(Envelope::from_value).unwrap_or_default();
    run.timeout_seconds = req.timeout_seconds;
    run.retry_policy = req.retry_policy;

    let run_id = state.engine.start_run(run).await?;
    let run = state.engine.run(run_id).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub steps: Vec<Step>,
}

pub async fn get(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<Json<RunDetail>, ApiError> {
    let run = state.engine.run(run_id).await?;
    let steps = state.engine.store().list_steps(run_id).await.map_err(|e| {
        ApiError(runloom_engine::EngineError::Store(e))
    })?;
    Ok(Json(RunDetail { run, steps }))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<Json<Run>, ApiError> {
    state.engine.pause_run(run_id).await?;
    Ok(Json(state.engine.run(run_id).await?))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<Json<Run>, ApiError> {
    state.engine.resume_run(run_id).await?;
    Ok(Json(state.engine.run(run_id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<Json<Run>, ApiError> {
    state.engine.cancel_run(run_id).await?;
    Ok(Json(state.engine.run(run_id).await?))
}
