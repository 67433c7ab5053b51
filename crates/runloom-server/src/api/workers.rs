// Worker-facing endpoints: register, heartbeat, unregister, claim, complete

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use runloom_engine::{QueueItem, WorkResult, WorkerInfo, WorkerStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::RequireAuth;
use crate::AppState;

use super::common::ApiError;

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    /// Stable identity; generated when omitted
    pub id: Option<String>,
    pub hostname: Option<String>,
    pub pid: Option<i32>,
    pub version: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub max_concurrent_steps: Option<i32>,
}

pub async fn register(
    State(state): State<AppState>,
    _auth: RequireAuth,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<(StatusCode, Json<WorkerInfo>), ApiError> {
    let hostname = req.hostname.unwrap_or_else(|| "unknown".to_string());
    let id = req.id.unwrap_or_else(|| {
        let suffix = Uuid::now_v7().simple().to_string();
        format!("{hostname}-remote-{}", &suffix[..8])
    });

    let worker = WorkerInfo {
        id,
        hostname,
        pid: req.pid,
        version: req.version,
        capabilities: req.capabilities.unwrap_or_else(|| vec!["*".to_string()]),
        status: WorkerStatus::Idle,
        started_at: Utc::now(),
        last_heartbeat: Utc::now(),
        max_concurrent_steps: req.max_concurrent_steps.unwrap_or(10),
        current_step_count: 0,
        total_steps_executed: 0,
        total_steps_failed: 0,
    };

    state.engine.register_worker(&worker).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub current_step_count: i32,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    _auth: RequireAuth,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .engine
        .update_worker_heartbeat(&worker_id, req.current_step_count)
        .await?;
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

pub async fn unregister(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    _auth: RequireAuth,
) -> Result<Json<StatusResponse>, ApiError> {
    state.engine.unregister_worker(&worker_id).await?;
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ClaimRequest {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

fn default_max_items() -> usize {
    1
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub items: Vec<QueueItem>,
}

pub async fn claim(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    _auth: RequireAuth,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    // The worker must exist: a claim from an unregistered worker would
    // never be heartbeated and always end in orphan recovery
    state.engine.worker(&worker_id).await?;

    let items = state.engine.claim_work(&worker_id, req.max_items).await?;
    Ok(Json(ClaimResponse { items }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub item_id: Uuid,
    pub result: WorkResult,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub run_id: Uuid,
}

pub async fn complete(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    _auth: RequireAuth,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let run_id = state
        .engine
        .complete_work(&worker_id, req.item_id, &req.result)
        .await?;
    Ok(Json(CompleteResponse { run_id }))
}
