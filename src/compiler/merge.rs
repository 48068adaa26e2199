//! Action classification and merge
//!
//! Folds the actions of one decision into exactly one outcome: the asset is
//! denied, or it is served with one merged module configuration.

use crate::error::{ControlError, ControlResult};
use crate::models::{Action, AssetId, ModuleConfig, Transform};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enforcement {
    /// At least one `Deny`. `discarded` counts transform actions dropped
    Denied { discarded: usize },
    /// Empty transforms means pass-through
    Transforms(ModuleConfig),
}

pub fn classify(asset_id: &AssetId, actions: &[Action]) -> ControlResult<Enforcement> {
    if actions.iter().any(|a| matches!(a, Action::Deny)) {
        let discarded = actions
            .iter()
            .filter(|a| matches!(a, Action::Redact { .. } | Action::Custom { .. }))
            .count();
        if discarded > 0 {
            debug!(asset = %asset_id, discarded, "Deny overrides transform actions");
        }
        return Ok(Enforcement::Denied { discarded });
    }

    let mut redact: BTreeSet<String> = BTreeSet::new();
    let mut custom: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();

    for action in actions {
        match action {
            Action::Allow | Action::Deny => {}
            Action::Redact { columns } => redact.extend(columns.iter().cloned()),
            Action::Custom { name, params } => {
                let merged = custom.entry(name.clone()).or_default();
                for (key, value) in params {
                    match merged.get(key) {
                        Some(existing) if existing != value => {
                            return Err(ControlError::ConflictingActions {
                                asset: asset_id.to_string(),
                                detail: format!(
                                    "Custom '{}' parameter '{}' is both {} and {}",
                                    name, key, existing, value
                                ),
                            });
                        }
                        Some(_) => {}
                        None => {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }
    }

    let mut transforms = Vec::with_capacity(custom.len() + 1);
    if !redact.is_empty() {
        transforms.push(Transform::Redact { columns: redact });
    }
    transforms.extend(
        custom
            .into_iter()
            .map(|(name, params)| Transform::Custom { name, params }),
    );

    Ok(Enforcement::Transforms(ModuleConfig { transforms }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn redact(cols: &[&str]) -> Action {
        Action::Redact {
            columns: cols.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn custom(name: &str, params: Value) -> Action {
        Action::Custom {
            name: name.into(),
            params: serde_json::from_value(params).unwrap(),
        }
    }

    fn asset() -> AssetId {
        AssetId::new("c/a")
    }

    #[test]
    fn test_empty_and_allow_are_passthrough() {
        for actions in [vec![], vec![Action::Allow, Action::Allow]] {
            assert_eq!(
                classify(&asset(), &actions).unwrap(),
                Enforcement::Transforms(ModuleConfig::passthrough())
            );
        }
    }

    #[test]
    fn test_deny_wins_over_transforms() {
        let actions = vec![redact(&["SSN"]), Action::Deny, custom("encrypt", json!({}))];
        assert_eq!(
            classify(&asset(), &actions).unwrap(),
            Enforcement::Denied { discarded: 2 }
        );
    }

    #[test]
    fn test_redact_columns_are_unioned() {
        let actions = vec![redact(&["SSN", "name"]), redact(&["SSN", "email"])];
        let Enforcement::Transforms(config) = classify(&asset(), &actions).unwrap() else {
            panic!("expected transforms");
        };
        assert_eq!(
            config.redacted_columns().into_iter().collect::<Vec<_>>(),
            vec!["SSN", "email", "name"]
        );
        assert_eq!(config.transforms.len(), 1);
    }

    #[test]
    fn test_custom_params_merge_by_name() {
        let actions = vec![
            custom("encrypt", json!({"algo": "aes"})),
            custom("encrypt", json!({"algo": "aes", "key": "k1"})),
            custom("bucketize", json!({"size": 10})),
            redact(&["SSN"]),
        ];
        let Enforcement::Transforms(config) = classify(&asset(), &actions).unwrap() else {
            panic!("expected transforms");
        };

        let names: Vec<String> = config.transforms.iter().map(|t| t.kind().to_string()).collect();
        assert_eq!(names, vec!["Redact", "Custom:bucketize", "Custom:encrypt"]);
        match &config.transforms[2] {
            Transform::Custom { params, .. } => assert_eq!(params.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_conflicting_custom_params() {
        let actions = vec![
            custom("encrypt", json!({"algo": "aes"})),
            custom("encrypt", json!({"algo": "rsa"})),
        ];
        let err = classify(&asset(), &actions).unwrap_err();
        assert_eq!(err.reason(), "ConflictingActions");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let a = vec![redact(&["x"]), custom("e", json!({"k": 1})), redact(&["y"])];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(classify(&asset(), &a).unwrap(), classify(&asset(), &b).unwrap());
    }
}
