use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::AppConfig};
use ingestion_orchestrator::Orchestrator;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub orchestrator: Arc<Orchestrator>,
}

impl ApiState {
    pub fn new(config: &AppConfig, db: Arc<SurrealDbClient>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            db,
            config: config.clone(),
            orchestrator,
        }
    }
}
