//! HTTP policy manager client
//!
//! Posts decision queries to `<base>/getPoliciesDecisions`. Transport errors,
//! timeouts, 429 and 5xx answers are transient; any other non-success status
//! or an undecodable body is a malformed decision.

use crate::config::ConfigError;
use crate::error::{ControlError, ControlResult};
use crate::governance::wire::{PolicyDecisionRequest, CREDENTIALS_HEADER};
use crate::governance::PolicyManager;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub struct HttpPolicyManager {
    client: Client,
    endpoint: Url,
}

impl HttpPolicyManager {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| ConfigError::InvalidValue(format!("GOVERNANCE_URL '{}': {}", base_url, e)))?;
        // `join` replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("getPoliciesDecisions")
            .map_err(|e| ConfigError::InvalidValue(format!("GOVERNANCE_URL '{}': {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ConfigError::InvalidValue(format!("HTTP client: {}", e)))?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl PolicyManager for HttpPolicyManager {
    fn name(&self) -> &str {
        "http-policy-manager"
    }

    async fn get_policy_decisions(
        &self,
        request: &PolicyDecisionRequest,
        credentials: Option<&str>,
    ) -> ControlResult<serde_json::Value> {
        let mut call = self.client.post(self.endpoint.clone()).json(request);
        if let Some(creds) = credentials {
            call = call.header(CREDENTIALS_HEADER, creds);
        }

        let response = call.send().await.map_err(|e| {
            ControlError::DecisionUnavailable(format!("policy manager request failed: {}", e))
        })?;

        let status = response.status();
        debug!(resource = %request.resource_id, %status, "Policy manager answered");

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ControlError::DecisionUnavailable(format!(
                "policy manager returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(ControlError::DecisionMalformed(format!(
                "policy manager rejected the query with {}",
                status
            )));
        }

        response.json::<serde_json::Value>().await.map_err(|e| {
            if e.is_timeout() {
                ControlError::DecisionUnavailable(format!("policy manager body timed out: {}", e))
            } else {
                ControlError::DecisionMalformed(format!("policy manager body is not JSON: {}", e))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::wire::decode_decision;
    use crate::models::{Action, ActionContext, ActionType};
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn query() -> PolicyDecisionRequest {
        PolicyDecisionRequest {
            resource_id: "s3/customers".into(),
            action: ActionContext {
                action_type: ActionType::Read,
                destination: "theshire".into(),
                processing_location: "theshire".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_round_trip_against_stub_engine() {
        let router = Router::new().route(
            "/getPoliciesDecisions",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(body["resourceID"], "s3/customers");
                assert_eq!(body["action"]["type"], "Read");
                let cred = headers
                    .get(CREDENTIALS_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({
                    "decisionID": format!("d-{}", cred),
                    "result": [{"action": {"type": "Redact", "columns": ["SSN"]}}]
                }))
            }),
        );
        let base = serve(router).await;

        let manager = HttpPolicyManager::new(&base, Duration::from_secs(2)).unwrap();
        let raw = manager.get_policy_decisions(&query(), Some("alice")).await.unwrap();
        let decision = decode_decision(raw).unwrap();

        assert_eq!(decision.decision_id, "d-alice");
        assert!(matches!(decision.actions[0], Action::Redact { .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let router = Router::new().route(
            "/getPoliciesDecisions",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let base = serve(router).await;

        let manager = HttpPolicyManager::new(&base, Duration::from_secs(2)).unwrap();
        let err = manager.get_policy_decisions(&query(), None).await.unwrap_err();
        assert_eq!(err.reason(), "DecisionUnavailable");
    }

    #[tokio::test]
    async fn test_client_error_and_garbage_are_malformed() {
        let router = Router::new()
            .route(
                "/bad/getPoliciesDecisions",
                post(|| async { (axum::http::StatusCode::BAD_REQUEST, "nope") }),
            )
            .route("/garbage/getPoliciesDecisions", post(|| async { "<html>" }));
        let base = serve(router).await;

        let bad = HttpPolicyManager::new(&format!("{}bad/", base), Duration::from_secs(2)).unwrap();
        let err = bad.get_policy_decisions(&query(), None).await.unwrap_err();
        assert_eq!(err.reason(), "DecisionMalformed");

        let garbage =
            HttpPolicyManager::new(&format!("{}garbage/", base), Duration::from_secs(2)).unwrap();
        let err = garbage.get_policy_decisions(&query(), None).await.unwrap_err();
        assert_eq!(err.reason(), "DecisionMalformed");
    }

    #[tokio::test]
    async fn test_base_path_without_trailing_slash() {
        let router = Router::new().route(
            "/v1/getPoliciesDecisions",
            post(|| async {
                Json(json!({"decisionID": "d-v1", "result": [{"action": {"type": "Allow"}}]}))
            }),
        );
        let base = serve(router).await;

        let manager = HttpPolicyManager::new(&format!("{}v1", base), Duration::from_secs(2)).unwrap();
        assert_eq!(manager.endpoint.path(), "/v1/getPoliciesDecisions");

        let raw = manager.get_policy_decisions(&query(), None).await.unwrap();
        assert_eq!(decode_decision(raw).unwrap().decision_id, "d-v1");
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager =
            HttpPolicyManager::new(&format!("http://{}/", addr), Duration::from_millis(500)).unwrap();
        let err = manager.get_policy_decisions(&query(), None).await.unwrap_err();
        assert_eq!(err.reason(), "DecisionUnavailable");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpPolicyManager::new("not a url", Duration::from_secs(1)).is_err());
    }
}
