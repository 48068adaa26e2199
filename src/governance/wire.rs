//! Policy manager wire format
//!
//! Responses are decoded as a tagged union on the `type` discriminator
//! (`Allow | Deny | Redact | Custom`). Unknown variants, missing fields and
//! empty payloads fail with `DecisionMalformed`.

use crate::error::{ControlError, ControlResult};
use crate::models::{Action, ActionContext, AssetId, Decision};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Header carrying the caller's opaque credentials
pub const CREDENTIALS_HEADER: &str = "X-Request-Datauser-Cred";

/// Body of a decision query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecisionRequest {
    #[serde(rename = "resourceID")]
    pub resource_id: String,
    pub action: ActionContext,
}

impl PolicyDecisionRequest {
    pub fn new(asset_id: &AssetId, context: &ActionContext) -> Self {
        Self {
            resource_id: asset_id.to_string(),
            action: context.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireDecisionResponse {
    #[serde(rename = "decisionID")]
    decision_id: String,
    #[serde(default)]
    result: Vec<WireResultItem>,
}

#[derive(Debug, Deserialize)]
struct WireResultItem {
    action: WireAction,
    /// Name of the policy that produced the action, informational only
    #[serde(default)]
    #[allow(dead_code)]
    policy: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireAction {
    Allow,
    Deny,
    #[serde(alias = "RedactAction")]
    Redact { columns: Vec<String> },
    Custom {
        name: String,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
    },
}

impl WireAction {
    fn into_action(self) -> ControlResult<Action> {
        match self {
            WireAction::Allow => Ok(Action::Allow),
            WireAction::Deny => Ok(Action::Deny),
            WireAction::Redact { columns } => {
                if columns.is_empty() {
                    return Err(ControlError::DecisionMalformed(
                        "Redact action without columns".to_string(),
                    ));
                }
                if columns.iter().any(|c| c.trim().is_empty()) {
                    return Err(ControlError::DecisionMalformed(
                        "Redact action with an empty column name".to_string(),
                    ));
                }
                Ok(Action::Redact {
                    columns: columns.into_iter().collect::<BTreeSet<_>>(),
                })
            }
            WireAction::Custom { name, params } => {
                if name.trim().is_empty() {
                    return Err(ControlError::DecisionMalformed(
                        "Custom action without a name".to_string(),
                    ));
                }
                Ok(Action::Custom { name, params })
            }
        }
    }
}

/// Decode and validate a raw policy manager response
pub fn decode_decision(raw: serde_json::Value) -> ControlResult<Decision> {
    let response: WireDecisionResponse = serde_json::from_value(raw)
        .map_err(|e| ControlError::DecisionMalformed(e.to_string()))?;

    if response.decision_id.trim().is_empty() {
        return Err(ControlError::DecisionMalformed(
            "response has an empty decisionID".to_string(),
        ));
    }

    let actions = response
        .result
        .into_iter()
        .map(|item| item.action.into_action())
        .collect::<ControlResult<Vec<_>>>()?;

    Ok(Decision {
        decision_id: response.decision_id,
        actions,
    })
}
