use std::{sync::Arc, time::Duration};

use common::{storage::db::SurrealDbClient, utils::config::get_config};
use ingestion_orchestrator::{run_reconcile_loop, run_worker_loop, Orchestrator, OrchestratorServices};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?
        .with_operation_timeout(Duration::from_secs(config.metadata_timeout_secs)),
    );
    db.ensure_initialized().await?;

    let services = OrchestratorServices::from_config(&config, Arc::clone(&db)).await?;
    let orchestrator = Arc::new(Orchestrator::new(services));

    info!("Starting worker process");
    tokio::select! {
        result = run_worker_loop(db, Arc::clone(&orchestrator)) => result,
        () = run_reconcile_loop(orchestrator) => Ok(()),
    }
}
