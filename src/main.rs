//! Dataplan Controller - Governed Data Access
//!
//! Users declare which governed datasets they need and for what. The
//! controller asks the governance engine for a decision per dataset, compiles
//! the decisions into a plan of access modules, deploys the plan and reports
//! per-dataset readiness until the request is deleted.
//!
//! PIPELINE:
//! - Decision Client: per-asset policy decisions with timeout and audit log
//! - Plan Compiler: decisions + module catalog -> deterministic plan
//! - Reconciliation Controller: drives deployments toward the current plan
//! - Status Reporter: per-asset and aggregate status for the caller

mod compiler;
mod config;
mod controller;
mod error;
mod governance;
mod models;
mod modules;
mod routes;
mod state;
mod status;
mod store;

use crate::compiler::PlanCompiler;
use crate::config::{BackendKind, RuntimeKind, Settings};
use crate::controller::reconcile::Reconciler;
use crate::controller::Controller;
use crate::governance::{DecisionClient, HttpPolicyManager, MockPolicyManager, PolicyManager};
use crate::modules::{HttpModuleRuntime, LocalModuleRuntime, ModuleCatalog, ModuleRuntime};
use crate::routes::create_router;
use crate::state::AppState;
use crate::store::RequestStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Polls a locally simulated module needs before it reports healthy
const LOCAL_MODULE_READY_AFTER: u32 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting Dataplan Controller - Governed Data Access...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let catalog = Arc::new(match &settings.runtime.catalog_path {
        Some(path) => {
            let catalog = ModuleCatalog::from_json_file(path)?;
            info!("📦 Module catalog loaded from {}", path.display());
            catalog
        }
        None => {
            info!("📦 Using built-in module catalog");
            ModuleCatalog::builtin()
        }
    });

    let policy_manager: Arc<dyn PolicyManager> = match settings.governance.backend {
        BackendKind::Mock => {
            warn!("⚠️  GOVERNANCE_BACKEND=mock, decisions come from built-in fixtures");
            Arc::new(MockPolicyManager::new())
        }
        BackendKind::Http => Arc::new(HttpPolicyManager::new(
            &settings.governance.url,
            settings.governance.decision_timeout,
        )?),
    };

    let runtime: Arc<dyn ModuleRuntime> = match settings.runtime.kind {
        RuntimeKind::Local => Arc::new(LocalModuleRuntime::new(
            Arc::clone(&catalog),
            LOCAL_MODULE_READY_AFTER,
        )),
        RuntimeKind::Http => Arc::new(HttpModuleRuntime::new(
            &settings.runtime.url,
            settings.governance.decision_timeout,
        )?),
    };
    info!(
        "🔌 Governance backend: {}, module runtime: {}",
        policy_manager.name(),
        runtime.name()
    );

    let store = RequestStore::new();
    let decisions = DecisionClient::new(policy_manager, settings.governance.decision_timeout);
    let reconciler = Reconciler::new(
        store.clone(),
        decisions.clone(),
        PlanCompiler::new(Arc::clone(&catalog), settings.compile.clone()),
        runtime,
        settings.controller.reconcile(),
    );
    let controller = Controller::new(store.clone(), reconciler, settings.controller.clone());
    let workers = controller.start();

    let state = Arc::new(AppState::new(
        store,
        Arc::clone(&controller),
        catalog,
        decisions.backend_name(),
    ));

    // Build the router
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Data Requests ───");
    info!("   POST   /api/requests                          - Create a data request");
    info!("   GET    /api/requests                          - List data requests");
    info!("   GET    /api/requests/{{namespace}}/{{name}}        - Get a data request");
    info!("   PUT    /api/requests/{{namespace}}/{{name}}        - Replace requested datasets");
    info!("   DELETE /api/requests/{{namespace}}/{{name}}        - Delete (tears down modules)");
    info!("   GET    /api/requests/{{namespace}}/{{name}}/status - Status report");
    info!("   GET    /api/requests/{{namespace}}/{{name}}/plan   - Compiled plan");
    info!("");
    info!("   ─── Governance ───");
    info!("   GET    /api/modules                           - Module catalog");
    info!("   POST   /api/decisions/refresh                 - Re-fetch all decisions");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller.shutdown().await;
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("⚠️  Controller task ended abnormally: {}", e);
        }
    }

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dataplan_controller=debug,tower_http=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
