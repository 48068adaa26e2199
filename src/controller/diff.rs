//! Deployment diff
//!
//! Compares a plan's flow steps with the deployments recorded for a request
//! and lists the corrective actions. Unchanged steps produce no action, which
//! is what makes re-running a tick free of side effects.

use crate::models::{AssetId, FlowStep, Plan};
use crate::modules::ModuleHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A module release the controller believes to be live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub handle: ModuleHandle,
    pub module_type: String,
    /// `FlowStep::fingerprint` of the deployed configuration
    pub fingerprint: String,
    pub deployed_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn new(handle: ModuleHandle, step: &FlowStep) -> Self {
        Self {
            handle,
            module_type: step.module_type.clone(),
            fingerprint: step.fingerprint(),
            deployed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentChange {
    Create(FlowStep),
    /// Replace the configuration. `previous` is torn down afterwards if the
    /// new step lands under a different handle.
    Update { step: FlowStep, previous: ModuleHandle },
    Unchanged(AssetId),
    Delete { asset_id: AssetId, handle: ModuleHandle },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentDiff {
    /// Creates and updates in plan order, then deletes in asset order
    pub changes: Vec<DeploymentChange>,
    pub summary: DiffSummary,
}

impl DeploymentDiff {
    pub fn is_noop(&self) -> bool {
        self.summary.created + self.summary.updated + self.summary.deleted == 0
    }
}

pub struct DiffEngine;

impl DiffEngine {
    pub fn diff(plan: &Plan, live: &BTreeMap<AssetId, DeploymentRecord>) -> DeploymentDiff {
        let mut changes = Vec::with_capacity(plan.flow_steps.len() + live.len());
        let mut summary = DiffSummary::default();

        for step in &plan.flow_steps {
            match live.get(&step.asset_id) {
                None => {
                    summary.created += 1;
                    changes.push(DeploymentChange::Create(step.clone()));
                }
                Some(record) if record.fingerprint != step.fingerprint() => {
                    summary.updated += 1;
                    changes.push(DeploymentChange::Update {
                        step: step.clone(),
                        previous: record.handle.clone(),
                    });
                }
                Some(_) => {
                    summary.unchanged += 1;
                    changes.push(DeploymentChange::Unchanged(step.asset_id.clone()));
                }
            }
        }

        let planned: BTreeSet<&AssetId> = plan.flow_steps.iter().map(|s| &s.asset_id).collect();
        for (asset_id, record) in live {
            if !planned.contains(asset_id) {
                summary.deleted += 1;
                changes.push(DeploymentChange::Delete {
                    asset_id: asset_id.clone(),
                    handle: record.handle.clone(),
                });
            }
        }

        DeploymentDiff { changes, summary }
    }
}
