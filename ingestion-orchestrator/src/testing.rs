use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use common::{
    error::AppError,
    provider::{memory::InMemoryIndexProvider, DynIndexProvider, ProviderClient},
    storage::{db::SurrealDbClient, store::StorageManager},
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    config::OrchestratorSettings,
    dispatch::{QueueDispatcher, TaskDispatcher},
    orchestrator::{OperationRequest, Orchestrator},
    process_next_task,
    services::OrchestratorServices,
};

/// Keeps dispatched requests in memory instead of queueing them.
#[derive(Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<OperationRequest>>,
    unavailable: AtomicBool,
}

impl RecordingDispatcher {
    /// Drains everything dispatched so far.
    pub async fn take(&self) -> Vec<OperationRequest> {
        std::mem::take(&mut *self.requests.lock().await)
    }

    /// While set, every dispatch is refused and nothing is recorded.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: &OperationRequest) -> Result<String, AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::InternalError("task queue unavailable".to_string()));
        }
        self.requests.lock().await.push(request.clone());
        Ok(Uuid::new_v4().to_string())
    }
}

/// Settings with every wait shortened to keep tests fast.
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        settle_delay: Duration::ZERO,
        readiness_poll_interval: Duration::from_millis(1),
        readiness_poll_attempts: 3,
        task_retry_base: Duration::ZERO,
        task_retry_max: Duration::ZERO,
        ..OrchestratorSettings::default()
    }
}

/// An orchestrator over in-memory metadata, blobs and provider.
pub struct TestHarness {
    pub db: Arc<SurrealDbClient>,
    pub storage: StorageManager,
    pub provider: Arc<InMemoryIndexProvider>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    pub async fn new() -> Result<Self, AppError> {
        Self::with_provider(InMemoryIndexProvider::new(), fast_settings()).await
    }

    /// Uses `storage` as the blob store, e.g. one wrapped to misbehave.
    pub async fn with_storage(storage: StorageManager) -> Result<Self, AppError> {
        let db = Arc::new(SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string()).await?);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        Ok(Self::assemble(
            db,
            storage,
            Arc::new(InMemoryIndexProvider::new()),
            Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
            dispatcher,
            fast_settings(),
        ))
    }

    pub async fn with_provider(
        provider: InMemoryIndexProvider,
        settings: OrchestratorSettings,
    ) -> Result<Self, AppError> {
        let db = Arc::new(SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string()).await?);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let harness = Self::assemble(
            db,
            StorageManager::memory(),
            Arc::new(provider),
            Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
            dispatcher,
            settings,
        );
        Ok(harness)
    }

    /// Dispatches go through the persistent task queue; drive them with
    /// [`TestHarness::run_queue`].
    pub async fn with_queue() -> Result<Self, AppError> {
        let db = Arc::new(SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string()).await?);
        let settings = fast_settings();
        let queue = Arc::new(QueueDispatcher::new(
            Arc::clone(&db),
            settings.task_max_attempts,
            settings.dispatch_timeout,
        ));
        Ok(Self::assemble(
            db,
            StorageManager::memory(),
            Arc::new(InMemoryIndexProvider::new()),
            queue,
            Arc::new(RecordingDispatcher::default()),
            settings,
        ))
    }

    fn assemble(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        provider: Arc<InMemoryIndexProvider>,
        dispatcher: Arc<dyn TaskDispatcher>,
        recorder: Arc<RecordingDispatcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        let client = ProviderClient::from(Arc::clone(&provider) as DynIndexProvider);
        let services = OrchestratorServices::new(
            Arc::clone(&db),
            storage.clone(),
            client,
            dispatcher,
            settings,
        );

        Self {
            db,
            storage,
            provider,
            dispatcher: recorder,
            orchestrator: Orchestrator::new(services),
        }
    }

    /// Executes every request recorded by the dispatcher, in order, the way a
    /// background consumer would.
    pub async fn run_dispatched(&self) -> Vec<Result<serde_json::Value, AppError>> {
        let mut results = Vec::new();
        for request in self.dispatcher.take().await {
            results.push(self.orchestrator.execute(request).await);
        }
        results
    }

    /// Runs queued tasks until none is ready. Returns how many were processed.
    pub async fn run_queue(&self) -> Result<usize, AppError> {
        let worker_id = format!("test-worker-{}", Utc::now().timestamp_micros());
        let lease = self.orchestrator.services().settings.worker_lease;
        let mut processed = 0_usize;
        while process_next_task(&self.db, &self.orchestrator, &worker_id, lease).await? {
            processed = processed.saturating_add(1);
        }
        Ok(processed)
    }
}
