#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod config;
pub mod dispatch;
pub mod documents;
pub mod ingestion;
pub mod migrator;
pub mod orchestrator;
pub mod provisioning;
pub mod reconciler;
pub mod services;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

#[cfg(test)]
mod tests;

use chrono::Utc;
use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::dispatch_task::DispatchTask},
};
pub use config::OrchestratorSettings;
pub use orchestrator::{Operation, OperationRequest, OperationResponse, Orchestrator};
pub use services::OrchestratorServices;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Drains the dispatch queue forever, one task at a time.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    orchestrator: Arc<Orchestrator>,
) -> Result<(), Box<dyn std::error::Error>> {
    let worker_id = format!("orchestrator-worker-{}", Uuid::new_v4());
    let lease_duration = orchestrator.services().settings.worker_lease;
    let idle_backoff = Duration::from_millis(500);

    loop {
        match process_next_task(&db, &orchestrator, &worker_id, lease_duration).await {
            Ok(true) => {}
            Ok(false) => sleep(idle_backoff).await,
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim dispatch task");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Claims and runs at most one due task. Returns `false` when the queue had
/// nothing ready. Errors from the task itself are recorded on the task, so
/// only queue access failures surface here.
pub async fn process_next_task(
    db: &SurrealDbClient,
    orchestrator: &Orchestrator,
    worker_id: &str,
    lease_duration: Duration,
) -> Result<bool, AppError> {
    let Some(task) = DispatchTask::claim_next_ready(db, worker_id, Utc::now(), lease_duration).await?
    else {
        return Ok(false);
    };

    let task_id = task.id.clone();
    info!(
        %worker_id,
        %task_id,
        operation = %task.operation,
        attempt = task.attempts,
        "claimed dispatch task"
    );
    if let Err(err) = process_task(db, orchestrator, task).await {
        error!(%worker_id, %task_id, error = %err, "dispatch task bookkeeping failed");
    }
    Ok(true)
}

async fn process_task(
    db: &SurrealDbClient,
    orchestrator: &Orchestrator,
    task: DispatchTask,
) -> Result<(), AppError> {
    let task = task.mark_processing(db).await?;

    let request: OperationRequest = match serde_json::from_str(&task.payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(task_id = %task.id, error = %err, "undecodable task payload");
            task.mark_dead_letter(&format!("invalid payload: {err}"), db)
                .await?;
            return Ok(());
        }
    };

    match orchestrator.execute(request.clone()).await {
        Ok(_) => {
            task.mark_succeeded(db).await?;
            info!(task_id = %task.id, operation = %task.operation, "dispatch task finished");
        }
        Err(err) if err.is_redeliverable() && task.can_retry() => {
            let delay = orchestrator
                .services()
                .settings
                .task_retry_delay(task.attempts);
            warn!(
                task_id = %task.id,
                attempt = task.attempts,
                retry_in_secs = delay.as_secs(),
                error = %err,
                "dispatch task failed; scheduling retry"
            );
            task.mark_failed(&err.to_string(), delay, db).await?;
        }
        Err(err) => {
            error!(
                task_id = %task.id,
                attempt = task.attempts,
                error = %err,
                "dispatch task will not be retried"
            );
            task.mark_dead_letter(&err.to_string(), db).await?;
            orchestrator.abandon(&request, &err).await;
        }
    }
    Ok(())
}

/// Periodically reconciles every tenant with documents waiting on a job.
pub async fn run_reconcile_loop(orchestrator: Arc<Orchestrator>) {
    let mut ticker = interval(orchestrator.services().settings.reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match orchestrator.reconciler().reconcile_all().await {
            Ok(report) if report.updated_count > 0 => {
                info!(updated = report.updated_count, "periodic reconcile applied job results");
            }
            Ok(_) => debug!("periodic reconcile found nothing to update"),
            Err(err) => warn!(error = %err, "periodic reconcile failed"),
        }
    }
}
