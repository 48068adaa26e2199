//! Decision Client
//!
//! Queries the governance engine for the enforcement actions applicable to one
//! dataset/action pair. Any backend implementing [`PolicyManager`] can be
//! plugged in: the HTTP client for a real engine, or the deterministic fixture
//! used in tests and local runs.

pub mod http;
pub mod mock;
pub mod wire;

pub use http::HttpPolicyManager;
pub use mock::MockPolicyManager;

use crate::error::{ControlError, ControlResult};
use crate::models::{ActionContext, AssetId, DataRequest, Decision, DecisionSnapshot};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use wire::PolicyDecisionRequest;

/// A governance engine backend
#[async_trait]
pub trait PolicyManager: Send + Sync {
    fn name(&self) -> &str;

    /// Return the raw, undecoded decision response
    async fn get_policy_decisions(
        &self,
        request: &PolicyDecisionRequest,
        credentials: Option<&str>,
    ) -> ControlResult<serde_json::Value>;
}

/// Timeout-bounded, validating front end over a [`PolicyManager`]
#[derive(Clone)]
pub struct DecisionClient {
    backend: Arc<dyn PolicyManager>,
    timeout: Duration,
}

impl DecisionClient {
    pub fn new(backend: Arc<dyn PolicyManager>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Fetch the decision for one asset under one action context
    pub async fn decide(
        &self,
        asset_id: &AssetId,
        context: &ActionContext,
        credentials: Option<&str>,
    ) -> ControlResult<Decision> {
        asset_id.resolve()?;

        let request = PolicyDecisionRequest::new(asset_id, context);
        let raw = tokio::time::timeout(
            self.timeout,
            self.backend.get_policy_decisions(&request, credentials),
        )
        .await
        .map_err(|_| {
            ControlError::DecisionUnavailable(format!(
                "{} did not answer for {} within {}ms",
                self.backend.name(),
                asset_id,
                self.timeout.as_millis()
            ))
        })??;

        let decision = wire::decode_decision(raw)?;

        info!(
            target: "audit",
            decision_id = %decision.decision_id,
            asset = %asset_id,
            action = %context.action_type,
            destination = %context.destination,
            enforcement = ?decision.actions.iter().map(|a| a.kind()).collect::<Vec<_>>(),
            "Governance decision received"
        );

        Ok(decision)
    }

    /// Fetch decisions for every dataset of a request. Queries run
    /// concurrently; the snapshot is returned only once all of them finished.
    pub async fn snapshot(&self, request: &DataRequest) -> DecisionSnapshot {
        let mut snapshot = DecisionSnapshot::new(request.generation);
        let mut tasks = JoinSet::new();

        for dataset in &request.datasets {
            let client = self.clone();
            let asset_id = dataset.asset_id.clone();
            let context = dataset.action_context();
            let credentials = request.credentials.clone();
            tasks.spawn(async move {
                let outcome = client
                    .decide(&asset_id, &context, credentials.as_deref())
                    .await;
                (asset_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((asset_id, outcome)) => {
                    if let Err(e) = &outcome {
                        debug!(asset = %asset_id, reason = e.reason(), "Decision query failed: {}", e);
                    }
                    snapshot.outcomes.insert(asset_id, outcome);
                }
                Err(e) => warn!("Decision task aborted: {}", e),
            }
        }

        // An aborted task leaves its asset without an outcome: treat as transient
        for dataset in &request.datasets {
            snapshot
                .outcomes
                .entry(dataset.asset_id.clone())
                .or_insert_with(|| {
                    Err(ControlError::DecisionUnavailable(
                        "decision query did not complete".to_string(),
                    ))
                });
        }

        snapshot
    }
}
