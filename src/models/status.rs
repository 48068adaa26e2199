//! Observed state models: per-asset and per-request status

use crate::error::ControlError;
use crate::models::plan::PlanRef;
use crate::models::request::AssetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Index of each condition in `AssetState::conditions`
pub const READY_CONDITION_INDEX: usize = 0;
pub const DENY_CONDITION_INDEX: usize = 1;
pub const ERROR_CONDITION_INDEX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetPhase {
    Pending,
    Denied,
    Deploying,
    Ready,
    Failed,
}

impl AssetPhase {
    /// Still waiting on decisions or module health
    pub fn in_progress(self) -> bool {
        matches!(self, AssetPhase::Pending | AssetPhase::Deploying)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPhase {
    Initializing,
    PlanPending,
    Deploying,
    Ready,
    PartiallyReady,
    Failed,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Ready,
    Deny,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    fn new(condition_type: ConditionType, status: ConditionStatus) -> Self {
        Self {
            condition_type,
            status,
            reason: String::new(),
            message: String::new(),
        }
    }

    fn with_reason(mut self, reason: &str, message: impl Into<String>) -> Self {
        self.reason = reason.to_string();
        self.message = message.into();
        self
    }
}

/// Access endpoint exposed by a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub protocol: String,
}

/// Observed status of one asset. Conditions always appear in the order
/// Ready, Deny, Error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetState {
    #[serde(rename = "assetID")]
    pub asset_id: AssetId,
    pub phase: AssetPhase,
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
}

impl AssetState {
    fn with(
        asset_id: &AssetId,
        phase: AssetPhase,
        ready: Condition,
        deny: Condition,
        error: Condition,
    ) -> Self {
        Self {
            asset_id: asset_id.clone(),
            phase,
            conditions: vec![ready, deny, error],
            endpoint: None,
        }
    }

    pub fn pending(asset_id: &AssetId) -> Self {
        Self::with(
            asset_id,
            AssetPhase::Pending,
            Condition::new(ConditionType::Ready, ConditionStatus::Unknown),
            Condition::new(ConditionType::Deny, ConditionStatus::Unknown),
            Condition::new(ConditionType::Error, ConditionStatus::False),
        )
    }

    /// Waiting on a transient condition (decision service, module health)
    pub fn waiting(asset_id: &AssetId, phase: AssetPhase, cause: &ControlError) -> Self {
        Self::with(
            asset_id,
            phase,
            Condition::new(ConditionType::Ready, ConditionStatus::False)
                .with_reason(cause.reason(), cause.to_string()),
            Condition::new(
                ConditionType::Deny,
                if phase == AssetPhase::Pending {
                    ConditionStatus::Unknown
                } else {
                    ConditionStatus::False
                },
            ),
            Condition::new(ConditionType::Error, ConditionStatus::False),
        )
    }

    pub fn denied(asset_id: &AssetId, decision_id: &str) -> Self {
        Self::with(
            asset_id,
            AssetPhase::Denied,
            Condition::new(ConditionType::Ready, ConditionStatus::False),
            Condition::new(ConditionType::Deny, ConditionStatus::True).with_reason(
                "AccessDenied",
                format!("Access denied by governance decision {}", decision_id),
            ),
            Condition::new(ConditionType::Error, ConditionStatus::False),
        )
    }

    /// Compiled fine but withheld because the request as a whole failed
    pub fn blocked(asset_id: &AssetId, message: &str) -> Self {
        Self::with(
            asset_id,
            AssetPhase::Pending,
            Condition::new(ConditionType::Ready, ConditionStatus::False)
                .with_reason("RequestFailed", message),
            Condition::new(ConditionType::Deny, ConditionStatus::False),
            Condition::new(ConditionType::Error, ConditionStatus::False),
        )
    }

    pub fn failed(asset_id: &AssetId, error: &ControlError) -> Self {
        Self::with(
            asset_id,
            AssetPhase::Failed,
            Condition::new(ConditionType::Ready, ConditionStatus::False),
            Condition::new(ConditionType::Deny, ConditionStatus::False),
            Condition::new(ConditionType::Error, ConditionStatus::True)
                .with_reason(error.reason(), error.to_string()),
        )
    }

    pub fn ready(asset_id: &AssetId, endpoint: Endpoint) -> Self {
        Self::with(
            asset_id,
            AssetPhase::Ready,
            Condition::new(ConditionType::Ready, ConditionStatus::True),
            Condition::new(ConditionType::Deny, ConditionStatus::False),
            Condition::new(ConditionType::Error, ConditionStatus::False),
        )
        .with_endpoint(endpoint)
    }

    fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Human-readable reason for a non-ready asset
    pub fn reason(&self) -> Option<String> {
        self.conditions
            .iter()
            .find(|c| !c.message.is_empty())
            .map(|c| format!("{}: {}", c.reason, c.message))
    }
}

/// Aggregate status of one data request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    pub phase: RequestPhase,
    pub observed_generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_plan_ref: Option<PlanRef>,
    pub asset_states: BTreeMap<AssetId, AssetState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition: DateTime<Utc>,
}

impl RequestStatus {
    pub fn initializing() -> Self {
        Self {
            phase: RequestPhase::Initializing,
            observed_generation: 0,
            generated_plan_ref: None,
            asset_states: BTreeMap::new(),
            message: None,
            last_transition: Utc::now(),
        }
    }

    /// Move to `phase`, stamping the transition time only on an actual change
    pub fn transition(&mut self, phase: RequestPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.last_transition = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_order_is_fixed() {
        let id = AssetId::new("c/a");
        let states = [
            AssetState::pending(&id),
            AssetState::denied(&id, "d-1"),
            AssetState::failed(&id, &ControlError::DecisionMalformed("bad".into())),
            AssetState::ready(
                &id,
                Endpoint {
                    hostname: "h".into(),
                    port: 80,
                    protocol: "fybrik-arrow-flight".into(),
                },
            ),
        ];
        for state in states {
            assert_eq!(state.conditions[READY_CONDITION_INDEX].condition_type, ConditionType::Ready);
            assert_eq!(state.conditions[DENY_CONDITION_INDEX].condition_type, ConditionType::Deny);
            assert_eq!(state.conditions[ERROR_CONDITION_INDEX].condition_type, ConditionType::Error);
        }
    }

    #[test]
    fn test_failed_asset_reports_reason() {
        let state = AssetState::failed(
            &AssetId::new("c/a"),
            &ControlError::NoCapableModule {
                asset: "c/a".into(),
                required: "Custom:encrypt".into(),
            },
        );
        assert_eq!(state.conditions[ERROR_CONDITION_INDEX].status, ConditionStatus::True);
        assert!(state.reason().unwrap().starts_with("NoCapableModule"));
    }
}
