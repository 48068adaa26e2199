//! HTTP module runtime client
//!
//! Talks to a release manager exposing
//! `PUT|DELETE <base>/namespaces/{ns}/releases/{release}` and
//! `GET <base>/namespaces/{ns}/releases/{release}/health`.

use crate::config::ConfigError;
use crate::error::{ControlError, ControlResult};
use crate::models::FlowStep;
use crate::modules::runtime::{ModuleHandle, ModuleHealth, ModuleRuntime};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub struct HttpModuleRuntime {
    client: Client,
    base: Url,
}

impl HttpModuleRuntime {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let mut base = Url::parse(base_url).map_err(|e| {
            ConfigError::InvalidValue(format!("MODULE_RUNTIME_URL '{}': {}", base_url, e))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue(format!("HTTP client: {}", e)))?;

        Ok(Self { client, base })
    }

    fn release_url(&self, handle: &ModuleHandle, suffix: &str) -> ControlResult<Url> {
        self.base
            .join(&format!(
                "namespaces/{}/releases/{}{}",
                handle.namespace, handle.release, suffix
            ))
            .map_err(|e| ControlError::ModuleRuntime(format!("bad release url for {}: {}", handle, e)))
    }
}

fn transport(err: reqwest::Error) -> ControlError {
    ControlError::ModuleRuntime(format!("module runtime request failed: {}", err))
}

#[async_trait]
impl ModuleRuntime for HttpModuleRuntime {
    fn name(&self) -> &str {
        "http"
    }

    async fn deploy(&self, step: &FlowStep) -> ControlResult<ModuleHandle> {
        let handle = ModuleHandle::for_step(step);
        let response = self
            .client
            .put(self.release_url(&handle, "")?)
            .json(step)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ControlError::ModuleRuntime(format!(
                "deploy of {} returned {}",
                handle, status
            )));
        }

        info!(release = %handle, module = %step.module_type, "Module release applied");
        Ok(handle)
    }

    async fn health(&self, handle: &ModuleHandle) -> ControlResult<ModuleHealth> {
        let response = self
            .client
            .get(self.release_url(handle, "/health")?)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        debug!(release = %handle, %status, "Module health polled");

        if status == StatusCode::NOT_FOUND {
            return Ok(ModuleHealth {
                healthy: false,
                endpoint: None,
                message: Some(format!("release {} not found", handle)),
            });
        }
        if !status.is_success() {
            return Err(ControlError::ModuleRuntime(format!(
                "health of {} returned {}",
                handle, status
            )));
        }

        response.json::<ModuleHealth>().await.map_err(|e| {
            ControlError::ModuleRuntime(format!("health of {} is not decodable: {}", handle, e))
        })
    }

    async fn teardown(&self, handle: &ModuleHandle) -> ControlResult<()> {
        let response = self
            .client
            .delete(self.release_url(handle, "")?)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            info!(release = %handle, "Module release removed");
            return Ok(());
        }
        Err(ControlError::ModuleRuntime(format!(
            "teardown of {} returned {}",
            handle, status
        )))
    }
}
