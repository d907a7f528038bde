use std::sync::Arc;

use common::{
    error::AppError,
    provider::{provider_from_config, ProviderClient},
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::{
        config::AppConfig,
        timeouts::{RetryPolicy, TimeoutConfig},
    },
};

use tracing::info;

use crate::{
    config::OrchestratorSettings,
    dispatch::{QueueDispatcher, TaskDispatcher},
};

/// Clients shared by every orchestrator component. Built once by the process
/// entrypoint and injected, so tests can swap in fakes.
pub struct OrchestratorServices {
    pub db: Arc<SurrealDbClient>,
    pub storage: StorageManager,
    pub provider: ProviderClient,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub settings: OrchestratorSettings,
}

impl OrchestratorServices {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        provider: ProviderClient,
        dispatcher: Arc<dyn TaskDispatcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            db,
            storage,
            provider,
            dispatcher,
            settings,
        }
    }

    /// Wires the blob store, provider and task queue selected by `cfg`.
    pub async fn from_config(cfg: &AppConfig, db: Arc<SurrealDbClient>) -> Result<Self, AppError> {
        let settings = OrchestratorSettings::from_config(cfg);
        let storage = StorageManager::new(cfg).await?;
        let provider = ProviderClient::new(
            provider_from_config(cfg)?,
            TimeoutConfig::from_config(cfg),
            RetryPolicy::from_config(cfg),
        );
        info!(
            provider = provider.name(),
            storage = ?cfg.storage,
            "orchestrator services configured"
        );
        let dispatcher = Arc::new(QueueDispatcher::new(
            Arc::clone(&db),
            settings.task_max_attempts,
            settings.dispatch_timeout,
        ));

        Ok(Self::new(db, storage, provider, dispatcher, settings))
    }
}
