use std::{sync::Arc, time::Duration};

use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use common::{storage::db::SurrealDbClient, utils::config::get_config};
use ingestion_orchestrator::{run_reconcile_loop, run_worker_loop, Orchestrator, OrchestratorServices};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
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

    // Ensure db is initialized
    db.ensure_initialized().await?;

    // One orchestrator serves the API, drains the queue and reconciles
    let services = OrchestratorServices::from_config(&config, Arc::clone(&db)).await?;
    let orchestrator = Arc::new(Orchestrator::new(services));
    let api_state = ApiState::new(&config, Arc::clone(&db), Arc::clone(&orchestrator));

    let app = Router::new()
        .nest("/api/v1", api_routes_v1(&api_state))
        .with_state(api_state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    info!("Starting worker and reconcile loops");
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = &result {
                error!("Server error: {}", e);
            }
            result?;
        }
        result = run_worker_loop(db, Arc::clone(&orchestrator)) => {
            if let Err(e) = &result {
                error!("Worker process error: {}", e);
            }
            result?;
        }
        () = run_reconcile_loop(orchestrator) => {}
    }

    Ok(())
}
