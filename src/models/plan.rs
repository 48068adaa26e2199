//! Deployment plan models
//!
//! A `Plan` is derived data: it is fully determined by a data request and the
//! decision snapshot it was compiled from, and is never edited by hand.

use crate::models::request::{ActionType, AssetId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// A transform capability, as declared by modules and required by plans
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransformKind {
    Redact,
    /// Rendered as `Custom:<name>`
    Custom(String),
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformKind::Redact => f.write_str("Redact"),
            TransformKind::Custom(name) => write!(f, "Custom:{}", name),
        }
    }
}

impl FromStr for TransformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "Redact" => Ok(TransformKind::Redact),
            Some(("Custom", name)) if !name.is_empty() => Ok(TransformKind::Custom(name.to_string())),
            _ => Err(format!("unknown transform capability '{}'", s)),
        }
    }
}

impl TryFrom<String> for TransformKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransformKind> for String {
    fn from(kind: TransformKind) -> Self {
        kind.to_string()
    }
}

/// A merged transform a module must apply to one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Transform {
    Redact {
        columns: BTreeSet<String>,
    },
    Custom {
        name: String,
        params: BTreeMap<String, serde_json::Value>,
    },
}

impl Transform {
    pub fn kind(&self) -> TransformKind {
        match self {
            Transform::Redact { .. } => TransformKind::Redact,
            Transform::Custom { name, .. } => TransformKind::Custom(name.clone()),
        }
    }
}

/// Enforcement configuration handed to a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub transforms: Vec<Transform>,
}

impl ModuleConfig {
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn is_passthrough(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn required_capabilities(&self) -> BTreeSet<TransformKind> {
        self.transforms.iter().map(Transform::kind).collect()
    }

    /// Columns the module must redact (empty when no redaction applies)
    pub fn redacted_columns(&self) -> BTreeSet<String> {
        self.transforms
            .iter()
            .filter_map(|t| match t {
                Transform::Redact { columns } => Some(columns.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// Where a module's access endpoint will be published
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointRef {
    pub namespace: String,
    pub name: String,
}

/// One asset's data-path segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStep {
    #[serde(rename = "assetID")]
    pub asset_id: AssetId,
    pub action: ActionType,
    pub module_type: String,
    pub module_config: ModuleConfig,
    pub endpoint_ref: EndpointRef,
}

impl FlowStep {
    /// Content fingerprint used to detect changed deployments
    pub fn fingerprint(&self) -> String {
        digest_of(self)
    }
}

/// Reference to a compiled plan, surfaced in request status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRef {
    pub namespace: String,
    pub name: String,
    pub digest: String,
}

/// Compiled deployment target for one data request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub name: String,
    pub modules_namespace: String,
    pub flow_steps: Vec<FlowStep>,
    pub digest: String,
}

impl Plan {
    pub fn new(name: String, modules_namespace: String, flow_steps: Vec<FlowStep>) -> Self {
        let digest = digest_of(&(&name, &modules_namespace, &flow_steps));
        Self {
            name,
            modules_namespace,
            flow_steps,
            digest,
        }
    }

    pub fn reference(&self) -> PlanRef {
        PlanRef {
            namespace: self.modules_namespace.clone(),
            name: self.name.clone(),
            digest: self.digest.clone(),
        }
    }

    pub fn step(&self, asset_id: &AssetId) -> Option<&FlowStep> {
        self.flow_steps.iter().find(|s| &s.asset_id == asset_id)
    }

    pub fn is_empty(&self) -> bool {
        self.flow_steps.is_empty()
    }
}

/// SHA-256 over the canonical JSON form. Maps are `BTreeMap`s throughout, so
/// equal values always serialize to equal bytes.
fn digest_of<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let hash = Sha256::digest(&bytes);
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Short stable hex hash of arbitrary parts, for generated resource names
pub fn short_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize()[..5].iter().map(|b| format!("{:02x}", b)).collect()
}
