//! Data request route handlers
//!
//! Create, inspect, edit and delete data requests. Every mutation enqueues the
//! request; the controller does the actual work.

use crate::error::{not_found_error, ApiResult};
use crate::models::{
    CreateDataRequest, DataRequest, Plan, RequestKey, RequestPhase, SuccessResponse,
    UpdateDataRequest,
};
use crate::state::SharedState;
use crate::status::{summarize, StatusReport, StatusReporter};
use crate::store::RequestEntry;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::{debug, info};
use validator::Validate;

// ==================== Response Types ====================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request: DataRequest,
    pub status: StatusReport,
}

impl From<&RequestEntry> for RequestResponse {
    fn from(entry: &RequestEntry) -> Self {
        Self {
            request: entry.request.clone(),
            status: StatusReporter::report(&entry.status),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub namespace: String,
    pub name: String,
    pub generation: u64,
    pub phase: RequestPhase,
    pub ready: bool,
    pub summary: String,
}

impl From<&RequestEntry> for RequestSummary {
    fn from(entry: &RequestEntry) -> Self {
        Self {
            namespace: entry.request.namespace.clone(),
            name: entry.request.name.clone(),
            generation: entry.request.generation,
            phase: entry.status.phase,
            ready: crate::status::is_ready(&entry.status),
            summary: summarize(&entry.status),
        }
    }
}

// ==================== Handlers ====================

/// Create a data request and hand it to the controller
pub async fn create_request(
    State(state): State<SharedState>,
    Json(payload): Json<CreateDataRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<RequestResponse>>)> {
    payload.validate()?;
    debug!("Creating data request {}/{}", payload.namespace, payload.name);

    let entry = state.store.create(DataRequest::from_create(payload)).await?;
    state.controller.enqueue(entry.key()).await;

    info!(request = %entry.key(), datasets = entry.request.datasets.len(), "Data request accepted");
    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            "Data request created.",
            RequestResponse::from(&entry),
        )),
    ))
}

/// List every data request with a one-line status summary
pub async fn list_requests(
    State(state): State<SharedState>,
) -> Json<SuccessResponse<Vec<RequestSummary>>> {
    let entries = state.store.list().await;
    let summaries: Vec<RequestSummary> = entries.iter().map(RequestSummary::from).collect();
    Json(SuccessResponse::with_data(
        format!("{} data request(s)", summaries.len()),
        summaries,
    ))
}

pub async fn get_request(
    State(state): State<SharedState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<SuccessResponse<RequestResponse>>> {
    let entry = lookup(&state, &namespace, &name).await?;
    Ok(Json(SuccessResponse::with_data(
        "Data request retrieved.",
        RequestResponse::from(&entry),
    )))
}

/// Replace the requested datasets; the next reconcile recompiles the plan
pub async fn update_request(
    State(state): State<SharedState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(payload): Json<UpdateDataRequest>,
) -> ApiResult<Json<SuccessResponse<RequestResponse>>> {
    payload.validate()?;

    let key = RequestKey::new(namespace, name);
    let entry = state.store.update_spec(&key, payload.datasets).await?;
    state.controller.enqueue(key).await;

    Ok(Json(SuccessResponse::with_data(
        "Data request updated.",
        RequestResponse::from(&entry),
    )))
}

/// Start deletion. Deployed modules are torn down asynchronously.
pub async fn delete_request(
    State(state): State<SharedState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<RequestResponse>>)> {
    let key = RequestKey::new(namespace, name);
    let entry = state.store.request_deletion(&key).await?;
    state.controller.enqueue(key).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(SuccessResponse::with_data(
            "Data request is terminating.",
            RequestResponse::from(&entry),
        )),
    ))
}

pub async fn get_status(
    State(state): State<SharedState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<StatusReport>> {
    let entry = lookup(&state, &namespace, &name).await?;
    Ok(Json(StatusReporter::report(&entry.status)))
}

/// The plan most recently compiled for the request
pub async fn get_plan(
    State(state): State<SharedState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<SuccessResponse<Plan>>> {
    let entry = lookup(&state, &namespace, &name).await?;
    let plan = entry.plan.ok_or_else(|| {
        not_found_error(format!("No plan has been compiled for {}/{} yet", namespace, name))
    })?;
    Ok(Json(SuccessResponse::with_data("Plan retrieved.", plan)))
}

async fn lookup(state: &SharedState, namespace: &str, name: &str) -> ApiResult<RequestEntry> {
    let key = RequestKey::new(namespace, name);
    state
        .store
        .get(&key)
        .await
        .ok_or_else(|| not_found_error(format!("Data request {} not found", key)))
}
