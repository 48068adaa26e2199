//! Deterministic policy manager fixture
//!
//! Answers by asset name, independent of catalog:
//! - `allow-dataset`: empty result (allow)
//! - `deny-dataset`: Deny
//! - `allow-theshire`: Deny unless the destination is `theshire`
//! - `deny-write`: Deny for `Write` only
//! - anything else: Redact column `SSN`
//!
//! Per-asset overrides and an "unreachable" switch let tests script other
//! answers and outages.

use crate::error::{ControlError, ControlResult};
use crate::governance::wire::PolicyDecisionRequest;
use crate::governance::PolicyManager;
use crate::models::{ActionType, AssetId};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

pub struct MockPolicyManager {
    overrides: RwLock<HashMap<String, Value>>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
}

impl MockPolicyManager {
    pub fn new() -> Self {
        Self {
            overrides: RwLock::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer queries for `asset_name` with this raw `result` array
    pub async fn set_override(&self, asset_name: &str, result: Value) {
        self.overrides
            .write()
            .await
            .insert(asset_name.to_string(), result);
    }

    /// Answer queries for `asset_name` with this entire raw response
    pub async fn set_raw_response(&self, asset_name: &str, response: Value) {
        self.overrides
            .write()
            .await
            .insert(format!("raw:{}", asset_name), response);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn deny() -> Value {
        json!([{ "action": { "type": "Deny" }, "policy": "deny-by-asset" }])
    }

    fn fixture_result(name: &str, request: &PolicyDecisionRequest) -> Value {
        match name {
            "allow-dataset" => json!([]),
            "deny-dataset" => Self::deny(),
            "allow-theshire" if request.action.destination != "theshire" => Self::deny(),
            "allow-theshire" => json!([]),
            "deny-write" if request.action.action_type == ActionType::Write => Self::deny(),
            "deny-write" => json!([]),
            _ => json!([{
                "action": { "type": "Redact", "columns": ["SSN"] },
                "policy": "redact-pii"
            }]),
        }
    }
}

impl Default for MockPolicyManager {
    fn default() -> Self {
        Self::new()
    }
}

fn decision_id() -> String {
    let bytes: [u8; 10] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl PolicyManager for MockPolicyManager {
    fn name(&self) -> &str {
        "mock-policy-manager"
    }

    async fn get_policy_decisions(
        &self,
        request: &PolicyDecisionRequest,
        _credentials: Option<&str>,
    ) -> ControlResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ControlError::DecisionUnavailable(
                "mock policy manager is unreachable".to_string(),
            ));
        }

        let resolved = AssetId::new(request.resource_id.clone()).resolve()?;
        debug!(
            asset = %resolved.name,
            destination = %request.action.destination,
            processing_location = %request.action.processing_location,
            "Mock policy manager query"
        );

        let overrides = self.overrides.read().await;
        if let Some(raw) = overrides.get(&format!("raw:{}", resolved.name)) {
            return Ok(raw.clone());
        }

        let result = overrides
            .get(&resolved.name)
            .cloned()
            .unwrap_or_else(|| Self::fixture_result(&resolved.name, request));

        Ok(json!({ "decisionID": decision_id(), "result": result }))
    }
}
