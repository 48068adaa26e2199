//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.
//! All controller timing lives in `ControllerConfig` and is passed down
//! explicitly.

use crate::compiler::{CompileOptions, CompilePolicy};
use crate::controller::backoff::Backoff;
use crate::controller::ReconcileConfig;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 8080,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Governance engine backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process fixture backend
    Mock,
    Http,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(BackendKind::Mock),
            "http" => Ok(BackendKind::Http),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Where modules get deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// In-process simulated releases
    Local,
    Http,
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(RuntimeKind::Local),
            "http" => Ok(RuntimeKind::Http),
            other => Err(format!("unknown module runtime '{}', expected 'local' or 'http'", other)),
        }
    }
}

/// Governance engine (policy manager) connection
#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    pub backend: BackendKind,
    pub url: String,
    pub decision_timeout: Duration,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Mock,
            url: "http://localhost:8181".to_string(),
            decision_timeout: Duration::from_millis(5000),
        }
    }
}

/// Module runtime and catalog
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub url: String,
    pub catalog_path: Option<PathBuf>,
    pub modules_namespace: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Local,
            url: "http://localhost:8282".to_string(),
            catalog_path: None,
            modules_namespace: "fybrik-blueprints".to_string(),
        }
    }
}

/// Reconciliation controller tuning
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
    pub retry_budget: u32,
    pub module_ready_budget: u32,
    pub resync_interval: Duration,
    pub decision_refresh: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff_base: Duration::from_millis(500),
            backoff_ceiling: Duration::from_millis(30_000),
            retry_budget: 10,
            module_ready_budget: 20,
            resync_interval: Duration::from_millis(30_000),
            decision_refresh: Duration::from_millis(60_000),
        }
    }
}

impl ControllerConfig {
    pub fn reconcile(&self) -> ReconcileConfig {
        ReconcileConfig {
            backoff: Backoff::new(self.backoff_base, self.backoff_ceiling),
            retry_budget: self.retry_budget,
            module_ready_budget: self.module_ready_budget,
            decision_refresh: self.decision_refresh,
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub governance: GovernanceConfig,
    pub runtime: RuntimeConfig,
    pub compile: CompileOptions,
    pub controller: ControllerConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists; a present but unreadable file is an error
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server = ServerConfig {
            host: parse_or(&lookup, "HOST", ServerConfig::default().host)?,
            port: parse_or(&lookup, "PORT", ServerConfig::default().port)?,
        };

        let cors = CorsConfig {
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let governance_defaults = GovernanceConfig::default();
        let governance = GovernanceConfig {
            backend: parse_or(&lookup, "GOVERNANCE_BACKEND", governance_defaults.backend)?,
            url: lookup("GOVERNANCE_URL").unwrap_or(governance_defaults.url),
            decision_timeout: millis_or(&lookup, "DECISION_TIMEOUT_MS", governance_defaults.decision_timeout)?,
        };
        if governance.backend == BackendKind::Http {
            validate_url("GOVERNANCE_URL", &governance.url)?;
        }

        let runtime_defaults = RuntimeConfig::default();
        let runtime = RuntimeConfig {
            kind: parse_or(&lookup, "MODULE_RUNTIME", runtime_defaults.kind)?,
            url: lookup("MODULE_RUNTIME_URL").unwrap_or(runtime_defaults.url),
            catalog_path: lookup("MODULE_CATALOG_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            modules_namespace: lookup("MODULES_NAMESPACE").unwrap_or(runtime_defaults.modules_namespace),
        };
        if runtime.kind == RuntimeKind::Http {
            validate_url("MODULE_RUNTIME_URL", &runtime.url)?;
        }

        let compile = CompileOptions {
            policy: parse_or(&lookup, "COMPILE_POLICY", CompilePolicy::Partial)?,
            fail_on_deny: parse_or(&lookup, "FAIL_ON_DENY", false)?,
            modules_namespace: runtime.modules_namespace.clone(),
        };

        let controller_defaults = ControllerConfig::default();
        let controller = ControllerConfig {
            workers: parse_or(&lookup, "CONTROLLER_WORKERS", controller_defaults.workers)?,
            backoff_base: millis_or(&lookup, "BACKOFF_BASE_MS", controller_defaults.backoff_base)?,
            backoff_ceiling: millis_or(&lookup, "BACKOFF_CEILING_MS", controller_defaults.backoff_ceiling)?,
            retry_budget: parse_or(&lookup, "RETRY_BUDGET", controller_defaults.retry_budget)?,
            module_ready_budget: parse_or(&lookup, "MODULE_READY_BUDGET", controller_defaults.module_ready_budget)?,
            resync_interval: millis_or(&lookup, "RESYNC_INTERVAL_MS", controller_defaults.resync_interval)?,
            decision_refresh: millis_or(&lookup, "DECISION_REFRESH_MS", controller_defaults.decision_refresh)?,
        };
        if controller.workers == 0 {
            return Err(ConfigError::InvalidValue("CONTROLLER_WORKERS must be at least 1".to_string()));
        }
        if controller.resync_interval.is_zero() {
            return Err(ConfigError::InvalidValue("RESYNC_INTERVAL_MS must be positive".to_string()));
        }

        Ok(Self {
            server,
            cors,
            governance,
            runtime,
            compile,
            controller,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{}='{}': {}", name, raw, e))),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, name, default.as_millis() as u64).map(Duration::from_millis)
}

fn validate_url(name: &str, raw: &str) -> Result<(), ConfigError> {
    url::Url::parse(raw)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue(format!("{}='{}': {}", name, raw, e)))
}
