//! In-process module runtime
//!
//! Simulates module releases without a cluster: a release turns healthy after
//! a configurable number of health polls and exposes an endpoint at
//! `<release>.<namespace>`. Reads through a release apply its redaction.

use crate::error::{ControlError, ControlResult};
use crate::models::{Endpoint, FlowStep};
use crate::modules::catalog::ModuleCatalog;
use crate::modules::runtime::{ModuleHandle, ModuleHealth, ModuleRuntime};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Value substituted for every redacted column
pub const REDACTED_PLACEHOLDER: &str = "XXXXX";

struct Release {
    step: FlowStep,
    polls: u32,
}

pub struct LocalModuleRuntime {
    catalog: Arc<ModuleCatalog>,
    ready_after: u32,
    releases: RwLock<HashMap<ModuleHandle, Release>>,
    failing: RwLock<HashSet<String>>,
    deploys: AtomicUsize,
    teardowns: AtomicUsize,
}

impl LocalModuleRuntime {
    /// `ready_after` is the number of health polls a fresh release answers
    /// unhealthy before reporting ready
    pub fn new(catalog: Arc<ModuleCatalog>, ready_after: u32) -> Self {
        Self {
            catalog,
            ready_after,
            releases: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
            deploys: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
        }
    }

    /// Keep a release unhealthy regardless of how often it is polled
    pub async fn set_failing(&self, release: &str, failing: bool) {
        let mut set = self.failing.write().await;
        if failing {
            set.insert(release.to_string());
        } else {
            set.remove(release);
        }
    }

    pub fn deploy_count(&self) -> usize {
        self.deploys.load(Ordering::SeqCst)
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub async fn release_count(&self) -> usize {
        self.releases.read().await.len()
    }

    pub async fn deployed_step(&self, handle: &ModuleHandle) -> Option<FlowStep> {
        self.releases.read().await.get(handle).map(|r| r.step.clone())
    }

    /// Read rows through a deployed release, masking every column its
    /// configuration redacts. Other columns pass through unchanged.
    pub async fn read_through(
        &self,
        handle: &ModuleHandle,
        rows: Vec<Map<String, Value>>,
    ) -> ControlResult<Vec<Map<String, Value>>> {
        let releases = self.releases.read().await;
        let release = releases
            .get(handle)
            .ok_or_else(|| ControlError::ModuleRuntime(format!("release {} not found", handle)))?;
        let redacted = release.step.module_config.redacted_columns();

        Ok(rows
            .into_iter()
            .map(|mut row| {
                for column in &redacted {
                    if let Some(value) = row.get_mut(column) {
                        *value = Value::String(REDACTED_PLACEHOLDER.to_string());
                    }
                }
                row
            })
            .collect())
    }
}

#[async_trait]
impl ModuleRuntime for LocalModuleRuntime {
    fn name(&self) -> &str {
        "local"
    }

    async fn deploy(&self, step: &FlowStep) -> ControlResult<ModuleHandle> {
        if self.catalog.get(&step.module_type).is_none() {
            return Err(ControlError::ModuleRuntime(format!(
                "unknown module type '{}'",
                step.module_type
            )));
        }

        let handle = ModuleHandle::for_step(step);
        let mut releases = self.releases.write().await;
        let replaced = releases.insert(
            handle.clone(),
            Release {
                step: step.clone(),
                polls: 0,
            },
        );
        self.deploys.fetch_add(1, Ordering::SeqCst);

        info!(
            release = %handle,
            module = %step.module_type,
            replaced = replaced.is_some(),
            "Module release deployed"
        );
        Ok(handle)
    }

    async fn health(&self, handle: &ModuleHandle) -> ControlResult<ModuleHealth> {
        let failing = self.failing.read().await.contains(&handle.release);
        let mut releases = self.releases.write().await;

        let Some(release) = releases.get_mut(handle) else {
            return Ok(ModuleHealth {
                healthy: false,
                endpoint: None,
                message: Some(format!("release {} not found", handle)),
            });
        };

        release.polls = release.polls.saturating_add(1);
        if failing || release.polls <= self.ready_after {
            debug!(release = %handle, polls = release.polls, "Module not ready");
            return Ok(ModuleHealth {
                healthy: false,
                endpoint: None,
                message: Some(if failing {
                    "module pods are crash looping".to_string()
                } else {
                    "module pods are starting".to_string()
                }),
            });
        }

        let endpoint = self.catalog.get(&release.step.module_type).map(|spec| Endpoint {
            hostname: format!("{}.{}", handle.release, handle.namespace),
            port: spec.port,
            protocol: spec.protocol.clone(),
        });

        Ok(ModuleHealth {
            healthy: true,
            endpoint,
            message: None,
        })
    }

    async fn teardown(&self, handle: &ModuleHandle) -> ControlResult<()> {
        if self.releases.write().await.remove(handle).is_some() {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            info!(release = %handle, "Module release removed");
        }
        Ok(())
    }
}
