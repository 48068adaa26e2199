//! Status Reporter
//!
//! Pure aggregation of per-asset state into the request phase and the
//! caller-facing report. Nothing here mutates stored state.

use crate::models::{
    AssetPhase, AssetState, Condition, Endpoint, PlanRef, RequestPhase, RequestStatus,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Fold asset phases into a request phase
pub fn aggregate_phase<'a>(
    assets: impl IntoIterator<Item = &'a AssetState>,
    all_or_nothing: bool,
) -> RequestPhase {
    let phases: Vec<AssetPhase> = assets.into_iter().map(|a| a.phase).collect();
    if phases.is_empty() {
        return RequestPhase::Deploying;
    }

    let count = |p: AssetPhase| phases.iter().filter(|&&x| x == p).count();
    let ready = count(AssetPhase::Ready);
    let failed = count(AssetPhase::Failed);
    let in_progress = phases.iter().filter(|p| p.in_progress()).count();

    if ready == phases.len() {
        return RequestPhase::Ready;
    }
    if failed > 0 && all_or_nothing {
        return RequestPhase::Failed;
    }
    if in_progress == phases.len() {
        return RequestPhase::Deploying;
    }
    if in_progress == 0 && ready == 0 && failed > 0 {
        return RequestPhase::Failed;
    }
    RequestPhase::PartiallyReady
}

/// True iff every non-denied asset is ready
pub fn is_ready(status: &RequestStatus) -> bool {
    matches!(status.phase, RequestPhase::Ready | RequestPhase::PartiallyReady)
        && !status.asset_states.is_empty()
        && status
            .asset_states
            .values()
            .all(|a| matches!(a.phase, AssetPhase::Ready | AssetPhase::Denied))
}

/// One-line human summary, e.g. "2/3 assets ready, 1 denied"
pub fn summarize(status: &RequestStatus) -> String {
    let total = status.asset_states.len();
    let count = |p: AssetPhase| status.asset_states.values().filter(|a| a.phase == p).count();

    let mut parts = vec![format!("{}/{} assets ready", count(AssetPhase::Ready), total)];
    for (phase, label) in [
        (AssetPhase::Denied, "denied"),
        (AssetPhase::Failed, "failed"),
        (AssetPhase::Deploying, "deploying"),
        (AssetPhase::Pending, "pending"),
    ] {
        let n = count(phase);
        if n > 0 {
            parts.push(format!("{} {}", n, label));
        }
    }
    parts.join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetReport {
    pub phase: AssetPhase,
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Request status as surfaced to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub ready: bool,
    pub phase: RequestPhase,
    pub observed_generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_plan_ref: Option<PlanRef>,
    pub asset_states: BTreeMap<String, AssetReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct StatusReporter;

impl StatusReporter {
    pub fn report(status: &RequestStatus) -> StatusReport {
        let asset_states = status
            .asset_states
            .iter()
            .map(|(id, state)| {
                let reason = match state.phase {
                    AssetPhase::Ready => None,
                    _ => state.reason(),
                };
                (
                    id.to_string(),
                    AssetReport {
                        phase: state.phase,
                        conditions: state.conditions.clone(),
                        endpoint: state.endpoint.clone(),
                        reason,
                    },
                )
            })
            .collect();

        StatusReport {
            ready: is_ready(status),
            phase: status.phase,
            observed_generation: status.observed_generation,
            generated_plan_ref: status.generated_plan_ref.clone(),
            asset_states,
            message: status.message.clone(),
        }
    }
}
