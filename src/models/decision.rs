//! Governance decision models

use crate::error::{ControlError, ControlResult};
use crate::models::request::AssetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One enforcement directive returned by the governance engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    Allow,
    Deny,
    Redact {
        columns: BTreeSet<String>,
    },
    Custom {
        name: String,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Allow => "Allow",
            Action::Deny => "Deny",
            Action::Redact { .. } => "Redact",
            Action::Custom { .. } => "Custom",
        }
    }
}

/// Decision for one `(asset, action context)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    #[serde(rename = "decisionID")]
    pub decision_id: String,
    /// Empty is equivalent to `Allow`
    pub actions: Vec<Action>,
}

impl Decision {
    pub fn is_deny(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, Action::Deny))
    }
}

/// All decisions fetched for one generation of a data request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionSnapshot {
    /// Request generation the decisions were fetched for
    pub generation: u64,
    pub fetched_at: DateTime<Utc>,
    pub outcomes: BTreeMap<AssetId, ControlResult<Decision>>,
}

impl DecisionSnapshot {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            fetched_at: Utc::now(),
            outcomes: BTreeMap::new(),
        }
    }

    /// First transient failure, if any. A snapshot carrying one is incomplete
    /// and must not be compiled into a deployable plan.
    pub fn transient_error(&self) -> Option<&ControlError> {
        self.outcomes.values().find_map(|outcome| match outcome {
            Err(e) if e.is_retryable() => Some(e),
            _ => None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.transient_error().is_none()
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.fetched_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_snapshot() {
        let mut snapshot = DecisionSnapshot::new(1);
        snapshot.outcomes.insert(
            AssetId::new("c/a"),
            Ok(Decision {
                decision_id: "d1".into(),
                actions: vec![],
            }),
        );
        snapshot
            .outcomes
            .insert(AssetId::new("c/b"), Err(ControlError::InvalidResource("bad".into())));
        assert!(snapshot.is_complete());

        snapshot.outcomes.insert(
            AssetId::new("c/c"),
            Err(ControlError::DecisionUnavailable("timeout".into())),
        );
        assert!(!snapshot.is_complete());
        assert_eq!(snapshot.transient_error().unwrap().reason(), "DecisionUnavailable");
    }
}
