//! Service-level route handlers: health, module catalog, decision refresh

use crate::models::SuccessResponse;
use crate::modules::ModuleSpec;
use crate::state::SharedState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::info;

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "governanceBackend": state.governance_backend,
        "requests": state.store.keys().await.len(),
    }))
}

/// Modules the compiler can place, with their capabilities
pub async fn list_modules(State(state): State<SharedState>) -> Json<SuccessResponse<Vec<ModuleSpec>>> {
    let modules: Vec<ModuleSpec> = state.catalog.list().into_iter().cloned().collect();
    Json(SuccessResponse::with_data(
        format!("{} module(s) in catalog", modules.len()),
        modules,
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub requests_enqueued: usize,
}

/// Policy change notification: re-fetch decisions for every request
pub async fn refresh_decisions(
    State(state): State<SharedState>,
) -> (StatusCode, Json<SuccessResponse<RefreshResponse>>) {
    let requests_enqueued = state.controller.refresh_decisions().await;
    info!(requests_enqueued, "Decision refresh accepted");
    (
        StatusCode::ACCEPTED,
        Json(SuccessResponse::with_data(
            "Decisions will be re-fetched.",
            RefreshResponse { requests_enqueued },
        )),
    )
}
