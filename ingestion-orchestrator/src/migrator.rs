use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        paths::{final_document_key, parse_pending_key, pending_tenant_prefix, PendingKey},
        types::{
            document::{Document, DocumentChanges},
            sync_status::{SyncEvent, SyncStatus},
            tenant_index::TenantIndex,
        },
    },
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{ingestion::IngestionTrigger, services::OrchestratorServices};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Documents moved to the tenant prefix and handed to the batch job.
    pub migrated: Vec<String>,
    pub failed: Vec<MigrationFailure>,
    /// Pending blobs that do not follow the key layout.
    pub skipped: Vec<String>,
    /// Documents whose record is no longer waiting for the index, e.g. already failed.
    pub left_pending: Vec<String>,
    /// Pending blobs with no document record yet; an upload may still be writing it.
    pub unclaimed: Vec<String>,
    pub job_id: Option<String>,
}

enum PendingOutcome {
    Moved,
    NotWaiting,
    Unclaimed,
}

/// Moves documents parked under `pending/{tenant_id}/` once the tenant's index exists.
#[derive(Clone)]
pub struct PendingMigrator {
    services: Arc<OrchestratorServices>,
    trigger: IngestionTrigger,
}

impl PendingMigrator {
    pub fn new(services: Arc<OrchestratorServices>, trigger: IngestionTrigger) -> Self {
        Self { services, trigger }
    }

    /// Migrates every pending blob of the tenant, continuing past per-item
    /// failures, then starts a single ingestion job for the whole batch.
    pub async fn migrate_pending(&self, index: &TenantIndex) -> Result<MigrationReport, AppError> {
        let tenant_id = index.tenant_id.as_str();
        let prefix = pending_tenant_prefix(tenant_id);
        let objects = self.services.storage.list(Some(&prefix)).await?;
        let mut report = MigrationReport::default();

        if objects.is_empty() {
            debug!(%tenant_id, "no pending documents");
            return Ok(report);
        }
        info!(%tenant_id, pending = objects.len(), "migrating pending documents");

        for object in objects {
            let key = object.location.to_string();
            let Some(pending) = parse_pending_key(tenant_id, &key) else {
                warn!(%tenant_id, %key, "pending blob does not match the key layout; skipping");
                report.skipped.push(key);
                continue;
            };

            match self.migrate_one(index, &key, &pending).await {
                Ok(PendingOutcome::Moved) => report.migrated.push(pending.document_id),
                Ok(PendingOutcome::NotWaiting) => report.left_pending.push(pending.document_id),
                Ok(PendingOutcome::Unclaimed) => report.unclaimed.push(key),
                Err(err) => {
                    warn!(
                        %tenant_id,
                        document_id = %pending.document_id,
                        %key,
                        error = %err,
                        "failed to migrate pending document; continuing"
                    );
                    report.failed.push(MigrationFailure {
                        key,
                        error: err.to_string(),
                    });
                }
            }
        }

        if report.migrated.is_empty() {
            return Ok(report);
        }

        match self.trigger.start_job(index, "pending documents batch").await {
            Ok(job_id) => {
                for document_id in &report.migrated {
                    let changes = DocumentChanges {
                        ingestion_job_id: Some(job_id.clone()),
                        status_message: Some("Ingestion started".to_string()),
                        ..Default::default()
                    };
                    Document::transition(document_id, SyncEvent::StartSync, changes, &self.services.db)
                        .await?;
                }
                report.job_id = Some(job_id);
            }
            Err(err) => {
                warn!(
                    %tenant_id,
                    index_id = %index.index_id,
                    error = %err,
                    "batch ingestion trigger failed; migrated documents marked failed"
                );
                let message = format!("Failed to start ingestion: {err}");
                for document_id in &report.migrated {
                    Document::transition(
                        document_id,
                        SyncEvent::Fail,
                        DocumentChanges::error(message.clone()),
                        &self.services.db,
                    )
                    .await?;
                }
            }
        }

        let migrated = i64::try_from(report.migrated.len()).unwrap_or(i64::MAX);
        if let Err(err) =
            TenantIndex::increment_document_count(tenant_id, migrated, &self.services.db).await
        {
            warn!(%tenant_id, error = %err, "failed to bump document count");
        }

        info!(
            %tenant_id,
            migrated = report.migrated.len(),
            failed = report.failed.len(),
            job_id = report.job_id.as_deref().unwrap_or("none"),
            "pending migration finished"
        );
        Ok(report)
    }

    /// Moves one pending blob, but only for a document that is still waiting
    /// on index creation. Every other blob stays where it is: one without a
    /// record may belong to an upload in flight, and any other record still
    /// points its `storage_key` at the pending copy.
    async fn migrate_one(
        &self,
        index: &TenantIndex,
        pending_key: &str,
        pending: &PendingKey,
    ) -> Result<PendingOutcome, AppError> {
        let tenant_id = index.tenant_id.as_str();
        let storage = &self.services.storage;

        let document = Document::get(&pending.document_id, &self.services.db).await?;
        let Some(document) = document.filter(|document| document.tenant_id == tenant_id) else {
            warn!(
                %tenant_id,
                document_id = %pending.document_id,
                %pending_key,
                "pending blob has no document record; left in place"
            );
            return Ok(PendingOutcome::Unclaimed);
        };
        if document.sync_status != SyncStatus::CreatingIndex {
            debug!(
                %tenant_id,
                document_id = %document.id,
                status = %document.sync_status,
                "pending document no longer waits for its index; left in place"
            );
            return Ok(PendingOutcome::NotWaiting);
        }

        let final_key = final_document_key(&index.tenant_hash, &pending.document_id, &pending.file_name);
        storage.copy(pending_key, &final_key).await?;

        let changes = DocumentChanges {
            storage_key: Some(final_key.clone()),
            index_id: Some(index.index_id.clone()),
            ingest_source_id: Some(index.ingest_source_id.clone()),
            status_message: Some("Ready for ingestion".to_string()),
            ..Default::default()
        };
        let updated =
            Document::transition(&document.id, SyncEvent::Migrate, changes, &self.services.db).await;

        match updated {
            Ok(Some(_)) => {
                if let Err(err) = storage.delete(pending_key).await {
                    warn!(
                        %tenant_id,
                        document_id = %document.id,
                        %pending_key,
                        error = %err,
                        "moved document but could not remove its pending copy"
                    );
                }
                info!(
                    %tenant_id,
                    document_id = %document.id,
                    %final_key,
                    "pending document moved"
                );
                Ok(PendingOutcome::Moved)
            }
            Ok(None) => {
                // The record left creating_index meanwhile; keep the blob where it points.
                self.discard_copy(tenant_id, &document.id, &final_key).await;
                Ok(PendingOutcome::NotWaiting)
            }
            Err(err) => {
                self.discard_copy(tenant_id, &document.id, &final_key).await;
                Err(err)
            }
        }
    }

    /// Removes the copy made for a move that did not land, unless the record
    /// points at that key by now (the background handler placed it there).
    async fn discard_copy(&self, tenant_id: &str, document_id: &str, final_key: &str) {
        match Document::get(document_id, &self.services.db).await {
            Ok(Some(document)) if document.storage_key == final_key => return,
            Ok(_) => {}
            Err(err) => {
                warn!(%tenant_id, %document_id, error = %err, "could not reload document; copy kept");
                return;
            }
        }
        if let Err(err) = self.services.storage.delete(final_key).await {
            warn!(
                %tenant_id,
                %document_id,
                %final_key,
                error = %err,
                "could not remove unclaimed copy under the tenant prefix"
            );
        }
    }
}
