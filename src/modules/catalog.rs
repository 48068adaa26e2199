//! Module capability catalog
//!
//! Read-only after startup and shared freely across concurrent reconciles.

use crate::config::ConfigError;
use crate::models::{ActionType, TransformKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

/// A deployable module type and what it can do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,
    pub actions: BTreeSet<ActionType>,
    #[serde(default)]
    pub transforms: BTreeSet<TransformKind>,
    /// Protocol of the access endpoint the module exposes
    pub protocol: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    80
}

impl ModuleSpec {
    fn can_serve(&self, action: ActionType, required: &BTreeSet<TransformKind>) -> bool {
        self.actions.contains(&action) && self.transforms.is_superset(required)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: BTreeMap<String, ModuleSpec>,
}

impl ModuleCatalog {
    pub fn new(modules: impl IntoIterator<Item = ModuleSpec>) -> Self {
        Self {
            modules: modules.into_iter().map(|m| (m.name.clone(), m)).collect(),
        }
    }

    /// Modules shipped with the controller
    pub fn builtin() -> Self {
        Self::new([
            ModuleSpec {
                name: "arrow-flight-module".to_string(),
                actions: [ActionType::Read, ActionType::Write].into_iter().collect(),
                transforms: [TransformKind::Redact].into_iter().collect(),
                protocol: "fybrik-arrow-flight".to_string(),
                port: 80,
            },
            ModuleSpec {
                name: "implicit-copy-batch".to_string(),
                actions: [ActionType::Copy].into_iter().collect(),
                transforms: [TransformKind::Redact].into_iter().collect(),
                protocol: "s3".to_string(),
                port: 443,
            },
        ])
    }

    /// Load a catalog from a JSON array of module specs
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::InvalidValue(format!("cannot read module catalog {}: {}", path.display(), e))
        })?;
        let specs: Vec<ModuleSpec> = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::ParseError(format!("module catalog {}: {}", path.display(), e))
        })?;
        if specs.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "module catalog {} declares no modules",
                path.display()
            )));
        }

        info!(path = %path.display(), modules = specs.len(), "Module catalog loaded");
        Ok(Self::new(specs))
    }

    pub fn list(&self) -> Vec<&ModuleSpec> {
        self.modules.values().collect()
    }

    pub fn get(&self, name: &str) -> Option<&ModuleSpec> {
        self.modules.get(name)
    }

    /// Pick the module serving `action` with the smallest capability set
    /// covering `required`. Ties go to the lexicographically smallest name.
    pub fn select(&self, action: ActionType, required: &BTreeSet<TransformKind>) -> Option<&ModuleSpec> {
        // BTreeMap iteration is name-ordered and min_by_key keeps the first minimum
        self.modules
            .values()
            .filter(|m| m.can_serve(action, required))
            .min_by_key(|m| m.transforms.len())
    }
}
