//! Plan Compiler
//!
//! Pure transformation from `(DataRequest, DecisionSnapshot)` to a `Plan` plus
//! per-asset verdicts. Nothing here touches live state; compiling the same
//! inputs twice yields the same plan and digest.

pub mod merge;

use crate::error::{ControlError, ControlResult};
use crate::models::{
    short_hash, AssetId, DataRequest, DecisionSnapshot, EndpointRef, FlowStep, ModuleConfig, Plan,
};
use crate::modules::ModuleCatalog;
use merge::{classify, Enforcement};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// How a single asset failure affects the rest of the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilePolicy {
    #[default]
    Partial,
    AllOrNothing,
}

impl FromStr for CompilePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partial" => Ok(CompilePolicy::Partial),
            "all-or-nothing" | "all_or_nothing" => Ok(CompilePolicy::AllOrNothing),
            other => Err(format!("unknown compile policy '{}'", other)),
        }
    }
}

impl fmt::Display for CompilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilePolicy::Partial => f.write_str("partial"),
            CompilePolicy::AllOrNothing => f.write_str("all-or-nothing"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub policy: CompilePolicy,
    /// Any deny empties the plan and fails the request
    pub fail_on_deny: bool,
    pub modules_namespace: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            policy: CompilePolicy::Partial,
            fail_on_deny: false,
            modules_namespace: "fybrik-blueprints".to_string(),
        }
    }
}

/// Compile-time classification of one asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetVerdict {
    Planned { module_type: String, decision_id: String },
    Denied { decision_id: String },
    Failed { error: ControlError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutcome {
    pub plan: Plan,
    pub verdicts: BTreeMap<AssetId, AssetVerdict>,
    /// Set when the request as a whole cannot proceed
    pub request_failure: Option<String>,
}

impl CompileOutcome {
    pub fn verdict(&self, asset_id: &AssetId) -> Option<&AssetVerdict> {
        self.verdicts.get(asset_id)
    }
}

pub struct PlanCompiler {
    catalog: Arc<ModuleCatalog>,
    options: CompileOptions,
}

impl PlanCompiler {
    pub fn new(catalog: Arc<ModuleCatalog>, options: CompileOptions) -> Self {
        Self { catalog, options }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Compile a plan. Fails with the transient error if the snapshot is
    /// missing a decision or carries a retryable failure, so a partially
    /// fetched decision set never becomes a plan.
    pub fn compile(
        &self,
        request: &DataRequest,
        snapshot: &DecisionSnapshot,
    ) -> ControlResult<CompileOutcome> {
        let mut steps = Vec::with_capacity(request.datasets.len());
        let mut verdicts = BTreeMap::new();

        for dataset in &request.datasets {
            let asset_id = &dataset.asset_id;
            let decision = match snapshot.outcomes.get(asset_id) {
                None => {
                    return Err(ControlError::DecisionUnavailable(format!(
                        "no decision fetched for {}",
                        asset_id
                    )))
                }
                Some(Err(e)) if e.is_retryable() => return Err(e.clone()),
                Some(Err(e)) => {
                    verdicts.insert(asset_id.clone(), AssetVerdict::Failed { error: e.clone() });
                    continue;
                }
                Some(Ok(decision)) => decision,
            };

            let config = match classify(asset_id, &decision.actions) {
                Ok(Enforcement::Denied { .. }) => {
                    verdicts.insert(
                        asset_id.clone(),
                        AssetVerdict::Denied {
                            decision_id: decision.decision_id.clone(),
                        },
                    );
                    continue;
                }
                Ok(Enforcement::Transforms(config)) => config,
                Err(error) => {
                    verdicts.insert(asset_id.clone(), AssetVerdict::Failed { error });
                    continue;
                }
            };

            let required = config.required_capabilities();
            let Some(module) = self.catalog.select(dataset.requested_action_type, &required) else {
                let error = ControlError::NoCapableModule {
                    asset: asset_id.to_string(),
                    required: describe_requirements(dataset.requested_action_type, &config),
                };
                verdicts.insert(asset_id.clone(), AssetVerdict::Failed { error });
                continue;
            };

            verdicts.insert(
                asset_id.clone(),
                AssetVerdict::Planned {
                    module_type: module.name.clone(),
                    decision_id: decision.decision_id.clone(),
                },
            );
            steps.push(FlowStep {
                asset_id: asset_id.clone(),
                action: dataset.requested_action_type,
                module_type: module.name.clone(),
                module_config: config,
                endpoint_ref: EndpointRef {
                    namespace: self.options.modules_namespace.clone(),
                    name: release_name(request, asset_id),
                },
            });
        }

        let request_failure = self.request_failure(&verdicts);
        if request_failure.is_some() {
            steps.clear();
        }

        let plan = Plan::new(
            format!("{}-{}", request.namespace, request.name),
            self.options.modules_namespace.clone(),
            steps,
        );

        info!(
            request = %request.key(),
            generation = request.generation,
            plan = %plan.name,
            digest = %plan.digest,
            steps = plan.flow_steps.len(),
            failure = request_failure.as_deref().unwrap_or(""),
            "Plan compiled"
        );

        Ok(CompileOutcome {
            plan,
            verdicts,
            request_failure,
        })
    }

    fn request_failure(&self, verdicts: &BTreeMap<AssetId, AssetVerdict>) -> Option<String> {
        if self.options.policy == CompilePolicy::AllOrNothing {
            let failed = verdicts.iter().find_map(|(asset, v)| match v {
                AssetVerdict::Failed { error } => Some((asset, error)),
                _ => None,
            });
            if let Some((asset, error)) = failed {
                return Some(format!("asset {} failed to compile: {}", asset, error));
            }
        }

        if self.options.fail_on_deny {
            let denied = verdicts
                .iter()
                .find(|(_, v)| matches!(v, AssetVerdict::Denied { .. }));
            if let Some((asset, _)) = denied {
                return Some(format!("access to asset {} was denied", asset));
            }
        }

        None
    }
}

fn describe_requirements(action: crate::models::ActionType, config: &ModuleConfig) -> String {
    let caps: Vec<String> = config
        .required_capabilities()
        .iter()
        .map(ToString::to_string)
        .collect();
    if caps.is_empty() {
        format!("{} pass-through", action)
    } else {
        format!("{} with {}", action, caps.join(", "))
    }
}

/// Stable, DNS-safe release name for one asset of one request
fn release_name(request: &DataRequest, asset_id: &AssetId) -> String {
    let prefix: String = request.name.chars().take(40).collect();
    let prefix = prefix.trim_end_matches('-');
    format!(
        "{}-{}",
        prefix,
        short_hash(&[&request.uid.to_string(), asset_id.as_str()])
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, ActionType, DatasetRequest, Decision, Transform};
    use crate::modules::ModuleSpec;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn request(assets: &[(&str, ActionType)]) -> DataRequest {
        DataRequest {
            name: "notebook".into(),
            namespace: "default".into(),
            uid: Uuid::nil(),
            generation: 1,
            credentials: None,
            datasets: assets
                .iter()
                .map(|(id, action)| DatasetRequest {
                    asset_id: AssetId::new(*id),
                    requested_action_type: *action,
                    destination: "theshire".into(),
                    processing_location: "theshire".into(),
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    fn snapshot(entries: Vec<(&str, ControlResult<Vec<Action>>)>) -> DecisionSnapshot {
        let mut snapshot = DecisionSnapshot::new(1);
        for (id, outcome) in entries {
            snapshot.outcomes.insert(
                AssetId::new(id),
                outcome.map(|actions| Decision {
                    decision_id: format!("d-{}", id),
                    actions,
                }),
            );
        }
        snapshot
    }

    fn redact_ssn() -> Action {
        Action::Redact {
            columns: ["SSN".to_string()].into_iter().collect(),
        }
    }

    fn compiler(policy: CompilePolicy, fail_on_deny: bool) -> PlanCompiler {
        PlanCompiler::new(
            Arc::new(ModuleCatalog::builtin()),
            CompileOptions {
                policy,
                fail_on_deny,
                modules_namespace: "blueprints".into(),
            },
        )
    }

    #[test]
    fn test_scenarios_compile() {
        let req = request(&[
            ("s3/allow-dataset", ActionType::Read),
            ("s3/deny-dataset", ActionType::Read),
            ("s3/customers", ActionType::Read),
        ]);
        let snap = snapshot(vec![
            ("s3/allow-dataset", Ok(vec![])),
            ("s3/deny-dataset", Ok(vec![Action::Deny])),
            ("s3/customers", Ok(vec![redact_ssn()])),
        ]);

        let outcome = compiler(CompilePolicy::Partial, false).compile(&req, &snap).unwrap();
        assert!(outcome.request_failure.is_none());

        let assets: Vec<&str> = outcome.plan.flow_steps.iter().map(|s| s.asset_id.as_str()).collect();
        assert_eq!(assets, vec!["s3/allow-dataset", "s3/customers"]);

        let passthrough = outcome.plan.step(&AssetId::new("s3/allow-dataset")).unwrap();
        assert!(passthrough.module_config.is_passthrough());
        assert_eq!(passthrough.module_type, "arrow-flight-module");

        let redacted = outcome.plan.step(&AssetId::new("s3/customers")).unwrap();
        assert_eq!(
            redacted.module_config.transforms,
            vec![Transform::Redact {
                columns: ["SSN".to_string()].into_iter().collect()
            }]
        );

        assert_eq!(
            outcome.verdict(&AssetId::new("s3/deny-dataset")),
            Some(&AssetVerdict::Denied {
                decision_id: "d-s3/deny-dataset".into()
            })
        );
        assert_eq!(outcome.plan.name, "default-notebook");
        assert_eq!(outcome.plan.modules_namespace, "blueprints");
    }

    #[test]
    fn test_compile_is_deterministic() {
        let req = request(&[("c/a", ActionType::Read), ("c/b", ActionType::Copy)]);
        let snap = snapshot(vec![("c/a", Ok(vec![redact_ssn()])), ("c/b", Ok(vec![]))]);
        let compiler = compiler(CompilePolicy::Partial, false);

        let first = compiler.compile(&req, &snap).unwrap();
        let second = compiler.compile(&req, &snap).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.plan.digest, second.plan.digest);
    }

    #[test]
    fn test_unsupported_transform_fails_only_that_asset() {
        let req = request(&[("c/a", ActionType::Read), ("c/b", ActionType::Read)]);
        let snap = snapshot(vec![
            (
                "c/a",
                Ok(vec![Action::Custom {
                    name: "encrypt".into(),
                    params: Default::default(),
                }]),
            ),
            ("c/b", Ok(vec![])),
        ]);

        let outcome = compiler(CompilePolicy::Partial, false).compile(&req, &snap).unwrap();
        assert_eq!(outcome.plan.flow_steps.len(), 1);
        match outcome.verdict(&AssetId::new("c/a")) {
            Some(AssetVerdict::Failed { error }) => assert_eq!(error.reason(), "NoCapableModule"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_custom_module_from_catalog_is_selected() {
        let mut modules: Vec<ModuleSpec> = ModuleCatalog::builtin().list().into_iter().cloned().collect();
        modules.push(ModuleSpec {
            name: "encrypting-flight".into(),
            actions: [ActionType::Read].into_iter().collect(),
            transforms: ["Redact", "Custom:encrypt"].iter().map(|t| t.parse().unwrap()).collect(),
            protocol: "fybrik-arrow-flight".into(),
            port: 80,
        });
        let compiler = PlanCompiler::new(Arc::new(ModuleCatalog::new(modules)), CompileOptions::default());

        let req = request(&[("c/a", ActionType::Read)]);
        let snap = snapshot(vec![(
            "c/a",
            Ok(vec![Action::Custom {
                name: "encrypt".into(),
                params: Default::default(),
            }]),
        )]);
        let outcome = compiler.compile(&req, &snap).unwrap();
        assert_eq!(outcome.plan.flow_steps[0].module_type, "encrypting-flight");
    }

    #[test]
    fn test_all_or_nothing_empties_plan() {
        let req = request(&[("c/a", ActionType::Read), ("c/b", ActionType::Read)]);
        let snap = snapshot(vec![
            ("c/a", Err(ControlError::DecisionMalformed("bad".into()))),
            ("c/b", Ok(vec![])),
        ]);

        let partial = compiler(CompilePolicy::Partial, false).compile(&req, &snap).unwrap();
        assert_eq!(partial.plan.flow_steps.len(), 1);
        assert!(partial.request_failure.is_none());

        let strict = compiler(CompilePolicy::AllOrNothing, false).compile(&req, &snap).unwrap();
        assert!(strict.plan.is_empty());
        assert!(strict.request_failure.unwrap().contains("c/a"));
    }

    #[test]
    fn test_fail_on_deny() {
        let req = request(&[("c/a", ActionType::Read), ("c/b", ActionType::Read)]);
        let snap = snapshot(vec![("c/a", Ok(vec![Action::Deny])), ("c/b", Ok(vec![]))]);

        let outcome = compiler(CompilePolicy::Partial, true).compile(&req, &snap).unwrap();
        assert!(outcome.plan.is_empty());
        assert!(outcome.request_failure.is_some());
    }

    #[test]
    fn test_incomplete_snapshot_is_not_compiled() {
        let req = request(&[("c/a", ActionType::Read), ("c/b", ActionType::Read)]);

        let missing = snapshot(vec![("c/a", Ok(vec![]))]);
        let err = compiler(CompilePolicy::Partial, false).compile(&req, &missing).unwrap_err();
        assert!(err.is_retryable());

        let transient = snapshot(vec![
            ("c/a", Ok(vec![])),
            ("c/b", Err(ControlError::DecisionUnavailable("timeout".into()))),
        ]);
        let err = compiler(CompilePolicy::Partial, false).compile(&req, &transient).unwrap_err();
        assert_eq!(err.reason(), "DecisionUnavailable");
    }

    #[test]
    fn test_release_names_are_stable_and_distinct() {
        let req = request(&[("c/a", ActionType::Read), ("c/b", ActionType::Read)]);
        let a = release_name(&req, &AssetId::new("c/a"));
        assert_eq!(a, release_name(&req, &AssetId::new("c/a")));
        assert_ne!(a, release_name(&req, &AssetId::new("c/b")));
        assert!(a.starts_with("notebook-"));
    }

    #[test]
    fn test_compile_policy_parse() {
        assert_eq!("partial".parse::<CompilePolicy>().unwrap(), CompilePolicy::Partial);
        assert_eq!(
            "All-Or-Nothing".parse::<CompilePolicy>().unwrap(),
            CompilePolicy::AllOrNothing
        );
        assert!("strict".parse::<CompilePolicy>().is_err());
    }
}
