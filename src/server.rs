//! Server setup and initialization
//!
//! Wires together storage, registry, execution engine, orchestrator,
//! scheduler and HTTP routes.

use crate::{
    api::{create_execution_routes, create_webhook_routes, create_workflow_routes, AppState},
    config::Config,
    execution::{
        orchestrator::ExecutionOrchestrator, queue::TokioTaskQueue, store::SqliteExecutionStore,
    },
    runtime::{
        engine::{EngineSettings, ExecutionEngine},
        integration::{DefaultIntegrationExecutor, IntegrationSettings},
        scheduler::CronSchedulerService,
    },
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage, validator::GraphValidator},
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;

    let db_path = config.database.database_path();
    tracing::info!("🗄️ Opening database: {}", db_path.display());
    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database '{}': {}", db_path.display(), e))?;

    let workflow_storage = WorkflowStorage::new(pool.clone());
    workflow_storage.init_schema().await?;
    let execution_store = Arc::new(SqliteExecutionStore::new(pool));
    execution_store.init_schema().await?;

    tracing::info!("⚙️ Initializing integration executor");
    let integrations = Arc::new(DefaultIntegrationExecutor::new(IntegrationSettings {
        http_timeout: config.engine.http_timeout(),
        mail_relay_url: config.engine.mail_relay_url.clone(),
    }));

    tracing::info!("📊 Initializing workflow registry");
    let registry = Arc::new(WorkflowRegistry::new(GraphValidator::with_configuration_checks(
        integrations.clone(),
    )));
    registry
        .init_from_storage(&workflow_storage)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

    tracing::info!("🚀 Initializing execution engine");
    let engine = Arc::new(
        ExecutionEngine::new(integrations, execution_store).with_settings(EngineSettings {
            max_wait: config.engine.max_wait(),
        }),
    );
    let queue = Arc::new(TokioTaskQueue::new(config.engine.background_workers));
    let orchestrator = Arc::new(ExecutionOrchestrator::new(Arc::clone(&registry), engine, queue));

    tracing::info!("⏰ Initializing cron scheduler service");
    let scheduler = Arc::new(
        CronSchedulerService::new(Arc::clone(&orchestrator))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?,
    );
    let scheduler_clone = Arc::clone(&scheduler);
    tokio::spawn(async move {
        if let Err(e) = scheduler_clone.start().await {
            tracing::error!("❌ Failed to start cron scheduler: {}", e);
        }
    });

    let state = AppState {
        storage: workflow_storage,
        registry,
        orchestrator,
        scheduler,
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_execution_routes())
        .merge(create_webhook_routes())
        .with_state(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowrun server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
