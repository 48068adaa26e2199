//! Module Runtime contract
//!
//! The runtime executes flow steps. The controller only ever deploys (create
//! or replace), polls health, and tears down; it never waits on a module.

use crate::error::ControlResult;
use crate::models::{Endpoint, FlowStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one deployed module release
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleHandle {
    pub namespace: String,
    pub release: String,
}

impl ModuleHandle {
    /// Handle under which `step` is (or will be) deployed
    pub fn for_step(step: &FlowStep) -> Self {
        Self {
            namespace: step.endpoint_ref.namespace.clone(),
            release: step.endpoint_ref.name.clone(),
        }
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.release)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub healthy: bool,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait ModuleRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Create the release or replace its configuration
    async fn deploy(&self, step: &FlowStep) -> ControlResult<ModuleHandle>;

    async fn health(&self, handle: &ModuleHandle) -> ControlResult<ModuleHealth>;

    /// Remove the release. Tearing down a missing release succeeds.
    async fn teardown(&self, handle: &ModuleHandle) -> ControlResult<()>;
}
