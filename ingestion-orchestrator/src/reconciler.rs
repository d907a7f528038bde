use std::{collections::BTreeSet, sync::Arc};

use common::{
    error::AppError,
    provider::{IngestionJobStatus, IngestionJobSummary},
    storage::types::{
        document::{Document, DocumentChanges},
        sync_status::{SyncEvent, SyncStatus},
        tenant_index::TenantIndex,
    },
};
use futures::{stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::services::OrchestratorServices;

const TENANT_RECONCILE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub updated_count: usize,
    pub completed: usize,
    pub failed: usize,
    pub jobs_checked: usize,
}

impl ReconcileReport {
    fn absorb(&mut self, other: &ReconcileReport) {
        self.updated_count += other.updated_count;
        self.completed += other.completed;
        self.failed += other.failed;
        self.jobs_checked += other.jobs_checked;
    }
}

/// Re-derives document status from the provider's ingestion jobs.
#[derive(Clone)]
pub struct IngestionReconciler {
    services: Arc<OrchestratorServices>,
}

impl IngestionReconciler {
    pub fn new(services: Arc<OrchestratorServices>) -> Self {
        Self { services }
    }

    /// Applies every terminal job in the tenant's recent window, then looks up
    /// jobs still referenced by in-flight documents that fell out of the window.
    /// Documents already terminal are never matched, so repeated calls converge.
    pub async fn reconcile(&self, tenant_id: &str) -> Result<ReconcileReport, AppError> {
        let db = &self.services.db;
        let index = TenantIndex::get(tenant_id, db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("knowledge base for tenant {tenant_id}")))?;

        let jobs = self
            .services
            .provider
            .list_ingestion_jobs(
                &index.index_id,
                &index.ingest_source_id,
                self.services.settings.list_jobs_max_results,
            )
            .await?;

        let mut report = ReconcileReport::default();
        let mut seen = BTreeSet::new();
        for job in &jobs {
            seen.insert(job.job_id.clone());
            report.absorb(&self.apply_job(tenant_id, job).await?);
        }

        let stragglers: Vec<String> = Document::in_flight_job_ids(tenant_id, db)
            .await?
            .into_iter()
            .filter(|job_id| !seen.contains(job_id))
            .collect();
        for job_id in stragglers {
            match self
                .services
                .provider
                .get_ingestion_job(&index.index_id, &index.ingest_source_id, &job_id)
                .await
            {
                Ok(job) => report.absorb(&self.apply_job(tenant_id, &job).await?),
                Err(err) => warn!(
                    %tenant_id,
                    %job_id,
                    error = %err,
                    "could not look up ingestion job outside the recent window"
                ),
            }
        }

        if report.updated_count > 0 {
            info!(
                %tenant_id,
                updated = report.updated_count,
                completed = report.completed,
                failed = report.failed,
                "reconciled documents"
            );
        } else {
            debug!(%tenant_id, jobs = report.jobs_checked, "nothing to reconcile");
        }
        Ok(report)
    }

    async fn apply_job(
        &self,
        tenant_id: &str,
        job: &IngestionJobSummary,
    ) -> Result<ReconcileReport, AppError> {
        let mut report = ReconcileReport {
            jobs_checked: 1,
            ..Default::default()
        };

        let (event, changes) = match job.status {
            IngestionJobStatus::Complete => (
                SyncEvent::Complete,
                DocumentChanges::message("Document indexed"),
            ),
            IngestionJobStatus::Failed => {
                let reason = if job.failure_reasons.is_empty() {
                    "Ingestion job failed".to_string()
                } else {
                    job.failure_reasons.join("; ")
                };
                (SyncEvent::Fail, DocumentChanges::error(reason))
            }
            _ => return Ok(report),
        };

        let documents =
            Document::find_by_job(tenant_id, &job.job_id, &SyncStatus::IN_FLIGHT, &self.services.db)
                .await?;

        for document in documents {
            let updated =
                Document::transition(&document.id, event, changes.clone(), &self.services.db).await?;
            if let Some(updated) = updated {
                info!(
                    %tenant_id,
                    document_id = %updated.id,
                    job_id = %job.job_id,
                    status = %updated.sync_status,
                    "document status reconciled"
                );
                report.updated_count += 1;
                match updated.sync_status {
                    SyncStatus::Completed => report.completed += 1,
                    SyncStatus::Failed => report.failed += 1,
                    _ => {}
                }
            }
        }
        Ok(report)
    }

    /// Reconciles every tenant that still has documents waiting on a job.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, AppError> {
        let tenants = Document::tenants_with_in_flight(&self.services.db).await?;

        let reports: Vec<_> = stream::iter(tenants)
            .map(|tenant_id| async move {
                let result = self.reconcile(&tenant_id).await;
                (tenant_id, result)
            })
            .buffer_unordered(TENANT_RECONCILE_CONCURRENCY)
            .collect()
            .await;

        let mut total = ReconcileReport::default();
        for (tenant_id, result) in reports {
            match result {
                Ok(report) => total.absorb(&report),
                Err(err) => warn!(%tenant_id, error = %err, "periodic reconcile failed"),
            }
        }
        Ok(total)
    }
}
