//! flowrun server entry point
//!
//! Serves:
//! - Workflow management API at /api/workflows/*
//! - Run lifecycle API at /api/executions/*
//! - Webhook triggers at /webhook/{workflow_id}
//! - Health check at /healthz

use flowrun::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004 and ./data/flowrun.db
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
