use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::dispatch_task::DispatchTask},
    utils::timeouts::{bounded, CallClass},
};
use tracing::info;

use crate::orchestrator::OperationRequest;

/// Hands an orchestrator request to a background consumer.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Fire-and-forget. Returns an id for the queued work.
    async fn dispatch(&self, request: &OperationRequest) -> Result<String, AppError>;
}

/// Persists requests as [`DispatchTask`] records that the worker loop drains.
/// Delivery is at-least-once.
pub struct QueueDispatcher {
    db: Arc<SurrealDbClient>,
    max_attempts: u32,
    timeout: Duration,
}

impl QueueDispatcher {
    pub fn new(db: Arc<SurrealDbClient>, max_attempts: u32, timeout: Duration) -> Self {
        Self {
            db,
            max_attempts,
            timeout,
        }
    }
}

#[async_trait]
impl TaskDispatcher for QueueDispatcher {
    async fn dispatch(&self, request: &OperationRequest) -> Result<String, AppError> {
        let payload = serde_json::to_string(request)?;
        let tenant_id = request.tenant_id.clone().unwrap_or_default();
        let operation = request.operation.name();

        let task = bounded(
            self.timeout,
            CallClass::Dispatch,
            "dispatch_task",
            DispatchTask::enqueue(operation, payload, &tenant_id, self.max_attempts, &self.db),
        )
        .await?;

        info!(task_id = %task.id, %tenant_id, operation, "queued background operation");
        Ok(task.id)
    }
}
