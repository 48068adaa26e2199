//! Data request models
//!
//! A `DataRequest` is the user's declared intent: which governed datasets are
//! needed, for which action, going where, processed where.

use crate::error::{ControlError, ControlResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;
use validator::{Validate, ValidationError};

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid DNS label pattern"));

/// Requested action on a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionType {
    Read,
    Write,
    Copy,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Read => "Read",
            ActionType::Write => "Write",
            ActionType::Copy => "Copy",
        };
        f.write_str(s)
    }
}

/// Catalog-qualified asset identifier (`<catalog>/<name>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

/// An asset identifier split into its catalog and name parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub catalog: String,
    pub name: String,
}

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve into `(catalog, name)`. Only the first `/` separates the two;
    /// the name itself may contain further slashes.
    pub fn resolve(&self) -> ControlResult<ResolvedAsset> {
        let invalid = || {
            ControlError::InvalidResource(format!(
                "asset id '{}' must have the form <catalog>/<name>",
                self.0
            ))
        };

        if self.0.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        match self.0.split_once('/') {
            Some((catalog, name)) if !catalog.is_empty() && !name.is_empty() => Ok(ResolvedAsset {
                catalog: catalog.to_string(),
                name: name.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Namespaced identity of a data request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub namespace: String,
    pub name: String,
}

impl RequestKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One dataset in a data request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRequest {
    #[validate(custom(function = "validate_asset_id"))]
    #[serde(rename = "assetID")]
    pub asset_id: AssetId,
    pub requested_action_type: ActionType,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub processing_location: String,
}

impl DatasetRequest {
    /// The action context handed to the governance engine, unchanged
    pub fn action_context(&self) -> ActionContext {
        ActionContext {
            action_type: self.requested_action_type,
            destination: self.destination.clone(),
            processing_location: self.processing_location.clone(),
        }
    }
}

/// Action context of a decision query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub destination: String,
    pub processing_location: String,
}

/// Payload for creating a data request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateDataRequest {
    #[validate(length(min = 1, max = 63, message = "Name must be between 1 and 63 characters"))]
    #[validate(custom(function = "validate_dns_label"))]
    pub name: String,
    #[serde(default = "default_namespace")]
    #[validate(custom(function = "validate_dns_label"))]
    pub namespace: String,
    /// Opaque credentials forwarded to the governance engine
    #[serde(default)]
    pub credentials: Option<String>,
    #[validate(length(min = 1, message = "At least one dataset is required"))]
    #[validate(custom(function = "validate_unique_assets"))]
    #[validate(nested)]
    pub datasets: Vec<DatasetRequest>,
}

/// Payload for replacing the datasets of an existing request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDataRequest {
    #[validate(length(min = 1, message = "At least one dataset is required"))]
    #[validate(custom(function = "validate_unique_assets"))]
    #[validate(nested)]
    pub datasets: Vec<DatasetRequest>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Declared intent to access governed datasets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub name: String,
    pub namespace: String,
    pub uid: Uuid,
    /// Bumped on every spec edit
    pub generation: u64,
    #[serde(skip_serializing, default)]
    pub credentials: Option<String>,
    pub datasets: Vec<DatasetRequest>,
    pub created_at: DateTime<Utc>,
}

impl DataRequest {
    pub fn from_create(req: CreateDataRequest) -> Self {
        Self {
            name: req.name,
            namespace: req.namespace,
            uid: Uuid::new_v4(),
            generation: 1,
            credentials: req.credentials,
            datasets: req.datasets,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.namespace, &self.name)
    }

    pub fn asset_ids(&self) -> impl Iterator<Item = &AssetId> {
        self.datasets.iter().map(|d| &d.asset_id)
    }
}

fn validate_dns_label(name: &str) -> Result<(), ValidationError> {
    if !DNS_LABEL.is_match(name) {
        let mut err = ValidationError::new("invalid_name");
        err.message = Some(
            "Must consist of lower case alphanumeric characters or '-', and start and end with an alphanumeric character".into(),
        );
        return Err(err);
    }
    Ok(())
}

fn validate_asset_id(id: &AssetId) -> Result<(), ValidationError> {
    if let Err(e) = id.resolve() {
        let mut err = ValidationError::new("invalid_asset_id");
        err.message = Some(e.to_string().into());
        return Err(err);
    }
    Ok(())
}

fn validate_unique_assets(datasets: &[DatasetRequest]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for dataset in datasets {
        if !seen.insert(&dataset.asset_id) {
            let mut err = ValidationError::new("duplicate_asset");
            err.message = Some(format!("Asset {} is requested more than once", dataset.asset_id).into());
            return Err(err);
        }
    }
    Ok(())
}
