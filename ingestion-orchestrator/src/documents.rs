use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        paths::{
            content_type_for, final_document_key, parse_pending_key, pending_document_key,
            sanitize_file_name, tenant_hash, validate_tenant_id,
        },
        store::BlobAttributes,
        types::{
            document::{Document, DocumentChanges},
            sync_status::{SyncEvent, SyncStatus},
            tenant_index::TenantIndex,
        },
    },
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    ingestion::{IngestionTrigger, TriggerOutcome},
    orchestrator::{Operation, OperationRequest},
    provisioning::IndexProvisioner,
    reconciler::IngestionReconciler,
    services::OrchestratorServices,
};

pub const FIRST_UPLOAD_MESSAGE: &str =
    "Creating your knowledge base. The first upload takes 2-3 minutes to become searchable.";

/// Immediate answer to an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub document_id: String,
    pub filename: String,
    pub sync_status: SyncStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub document_id: String,
    pub knowledge_base_id: String,
    pub data_source_id: String,
    pub sync_status: SyncStatus,
    /// `true` when an earlier delivery or the pending migration already placed the document.
    pub already_handled: bool,
    pub ingestion: Option<TriggerOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteReceipt {
    pub document_id: String,
    pub deleted: bool,
    pub blob_deleted: bool,
    pub resync_job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusReport {
    pub document_id: String,
    pub filename: String,
    pub sync_status: SyncStatus,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub ingestion_job_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<Document> for SyncStatusReport {
    fn from(document: Document) -> Self {
        Self {
            document_id: document.id,
            filename: document.filename,
            sync_status: document.sync_status,
            status_message: document.status_message,
            error_message: document.error_message,
            ingestion_job_id: document.ingestion_job_id,
            updated_at: document.updated_at,
        }
    }
}

/// Tracks uploaded documents from blob placement to a terminal sync status.
#[derive(Clone)]
pub struct DocumentTracker {
    services: Arc<OrchestratorServices>,
    provisioner: IndexProvisioner,
    trigger: IngestionTrigger,
    reconciler: IngestionReconciler,
}

impl DocumentTracker {
    pub fn new(
        services: Arc<OrchestratorServices>,
        provisioner: IndexProvisioner,
        trigger: IngestionTrigger,
        reconciler: IngestionReconciler,
    ) -> Self {
        Self {
            services,
            provisioner,
            trigger,
            reconciler,
        }
    }

    /// Stores an upload and answers without waiting for index provisioning.
    #[instrument(skip(self, content), fields(%tenant_id, %filename, size = content.len()))]
    pub async fn process_document(
        &self,
        tenant_id: &str,
        filename: &str,
        content: Bytes,
    ) -> Result<UploadReceipt, AppError> {
        validate_tenant_id(tenant_id)?;
        if filename.trim().is_empty() {
            return Err(AppError::Validation("filename is required".to_string()));
        }

        let document_id = Uuid::new_v4().to_string();
        match self.provisioner.get_existing(tenant_id).await? {
            Some(index) => {
                self.upload_to_index(&index, &document_id, filename, content)
                    .await
            }
            None => {
                self.upload_pending(tenant_id, &document_id, filename, content)
                    .await
            }
        }
    }

    async fn upload_to_index(
        &self,
        index: &TenantIndex,
        document_id: &str,
        filename: &str,
        content: Bytes,
    ) -> Result<UploadReceipt, AppError> {
        let tenant_id = index.tenant_id.as_str();
        let safe_name = sanitize_file_name(filename);
        let content_type = content_type_for(filename);
        let key = final_document_key(&index.tenant_hash, document_id, &safe_name);
        let size = content.len() as u64;

        let attributes = upload_attributes(tenant_id, document_id, filename, &content_type);
        self.services.storage.put(&key, content, attributes).await?;

        let mut document = Document::new(
            document_id.to_string(),
            tenant_id,
            filename,
            &content_type,
            size,
            key,
            SyncStatus::Uploaded,
            Some("Uploaded".to_string()),
        )?;
        document.index_id = Some(index.index_id.clone());
        document.ingest_source_id = Some(index.ingest_source_id.clone());
        document.insert(&self.services.db).await?;
        info!(%tenant_id, %document_id, "document uploaded to tenant prefix");

        let outcome = self.trigger.trigger_for_document(index, document_id).await?;
        self.bump_document_count(tenant_id).await;

        let (sync_status, message) = match outcome {
            TriggerOutcome::Started { .. } => (
                SyncStatus::Processing,
                "Document uploaded. Ingestion started.".to_string(),
            ),
            TriggerOutcome::Failed { error } => (SyncStatus::Failed, error),
        };

        Ok(UploadReceipt {
            document_id: document_id.to_string(),
            filename: filename.to_string(),
            sync_status,
            message,
        })
    }

    async fn upload_pending(
        &self,
        tenant_id: &str,
        document_id: &str,
        filename: &str,
        content: Bytes,
    ) -> Result<UploadReceipt, AppError> {
        let safe_name = sanitize_file_name(filename);
        let content_type = content_type_for(filename);
        let temp_key = pending_document_key(tenant_id, document_id, &safe_name);
        let size = content.len() as u64;

        let attributes = upload_attributes(tenant_id, document_id, filename, &content_type)
            .meta("pending_index_creation", "true");
        self.services
            .storage
            .put(&temp_key, content, attributes)
            .await?;

        Document::new(
            document_id.to_string(),
            tenant_id,
            filename,
            &content_type,
            size,
            temp_key.clone(),
            SyncStatus::CreatingIndex,
            Some(FIRST_UPLOAD_MESSAGE.to_string()),
        )?
        .insert(&self.services.db)
        .await?;

        let request = OperationRequest::new(
            tenant_id,
            Operation::CreateAndProcess {
                document_id: document_id.to_string(),
                filename: safe_name,
                temp_key,
            },
        );
        if let Err(err) = self.services.dispatcher.dispatch(&request).await {
            warn!(%tenant_id, %document_id, error = %err, "could not queue index creation");
            let message = format!("Failed to queue index creation: {err}");
            Document::transition(
                document_id,
                SyncEvent::Fail,
                DocumentChanges::error(message.clone()),
                &self.services.db,
            )
            .await?;
            return Ok(UploadReceipt {
                document_id: document_id.to_string(),
                filename: filename.to_string(),
                sync_status: SyncStatus::Failed,
                message,
            });
        }
        info!(%tenant_id, %document_id, "document parked until the tenant index exists");

        Ok(UploadReceipt {
            document_id: document_id.to_string(),
            filename: filename.to_string(),
            sync_status: SyncStatus::CreatingIndex,
            message: FIRST_UPLOAD_MESSAGE.to_string(),
        })
    }

    /// Background half of the slow path: provision the index, place the
    /// document and start ingestion. Safe to run more than once per document.
    ///
    /// Errors that a redelivery cannot fix fail the document right away;
    /// transient ones are returned for the queue to retry.
    #[instrument(skip(self), fields(%tenant_id, %document_id))]
    pub async fn create_and_process(
        &self,
        tenant_id: &str,
        document_id: &str,
        filename: &str,
        temp_key: &str,
    ) -> Result<ProcessOutcome, AppError> {
        match self
            .place_and_ingest(tenant_id, document_id, filename, temp_key)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) if !err.is_redeliverable() => {
                self.fail_document(tenant_id, document_id, &err).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn place_and_ingest(
        &self,
        tenant_id: &str,
        document_id: &str,
        filename: &str,
        temp_key: &str,
    ) -> Result<ProcessOutcome, AppError> {
        validate_tenant_id(tenant_id)?;
        let pending = parse_pending_key(tenant_id, temp_key).ok_or_else(|| {
            AppError::Validation(format!("temp key {temp_key} is not a pending key of the tenant"))
        })?;
        if pending.document_id != document_id || pending.file_name != filename {
            return Err(AppError::Validation(format!(
                "temp key {temp_key} does not belong to document {document_id}"
            )));
        }

        // Provisioning also migrates every pending blob, this one included.
        let index = self.provisioner.get_or_create(tenant_id).await?;
        let db = &self.services.db;

        let document = Document::get_owned(document_id, tenant_id, db).await?;
        if document.sync_status != SyncStatus::CreatingIndex {
            debug!(status = %document.sync_status, "document already placed");
            return Ok(ProcessOutcome {
                document_id: document_id.to_string(),
                knowledge_base_id: index.index_id,
                data_source_id: index.ingest_source_id,
                sync_status: document.sync_status,
                already_handled: true,
                ingestion: None,
            });
        }

        let final_key = final_document_key(&index.tenant_hash, document_id, filename);
        let storage = &self.services.storage;
        if storage.exists(temp_key).await? {
            storage.copy(temp_key, &final_key).await?;
            storage.delete(temp_key).await?;
            info!(%final_key, "document moved to tenant prefix");
        } else if storage.exists(&final_key).await? {
            debug!(%final_key, "document already at its final key");
        } else {
            return Err(AppError::NotFound(format!(
                "document blob at {temp_key} or {final_key}"
            )));
        }

        let changes = DocumentChanges {
            storage_key: Some(final_key),
            index_id: Some(index.index_id.clone()),
            ingest_source_id: Some(index.ingest_source_id.clone()),
            status_message: Some("Knowledge base ready. Starting ingestion.".to_string()),
            ..Default::default()
        };
        let Some(placed) = Document::transition(document_id, SyncEvent::IndexReady, changes, db).await?
        else {
            let current = Document::get_owned(document_id, tenant_id, db).await?;
            return Ok(ProcessOutcome {
                document_id: document_id.to_string(),
                knowledge_base_id: index.index_id,
                data_source_id: index.ingest_source_id,
                sync_status: current.sync_status,
                already_handled: true,
                ingestion: None,
            });
        };
        info!(status = %placed.sync_status, "document placed after index creation");

        let outcome = self.trigger.trigger_for_document(&index, document_id).await?;
        self.bump_document_count(tenant_id).await;

        let sync_status = match outcome {
            TriggerOutcome::Started { .. } => SyncStatus::Syncing,
            TriggerOutcome::Failed { .. } => SyncStatus::Failed,
        };
        Ok(ProcessOutcome {
            document_id: document_id.to_string(),
            knowledge_base_id: index.index_id,
            data_source_id: index.ingest_source_id,
            sync_status,
            already_handled: false,
            ingestion: Some(outcome),
        })
    }

    /// Moves a document to `failed` with the error attached. Used when its
    /// background work will not be attempted again.
    pub async fn fail_document(&self, tenant_id: &str, document_id: &str, err: &AppError) {
        let changes = DocumentChanges::error(err.to_string());
        match Document::transition(document_id, SyncEvent::Fail, changes, &self.services.db).await {
            Ok(Some(_)) => warn!(%tenant_id, %document_id, error = %err, "document marked failed"),
            Ok(None) => debug!(%tenant_id, %document_id, "document already terminal"),
            Err(update_err) => warn!(
                %tenant_id,
                %document_id,
                error = %update_err,
                "could not mark document failed"
            ),
        }
    }

    pub async fn list_documents(&self, tenant_id: &str) -> Result<Vec<Document>, AppError> {
        validate_tenant_id(tenant_id)?;
        Document::list_for_tenant(tenant_id, &self.services.db).await
    }

    /// Removes the document record and, best effort, its blob, then asks for a
    /// full re-sync so the index forgets the document.
    #[instrument(skip(self), fields(%tenant_id, %document_id))]
    pub async fn delete_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<DeleteReceipt, AppError> {
        validate_tenant_id(tenant_id)?;
        let db = &self.services.db;
        let document = Document::get_owned(document_id, tenant_id, db).await?;

        let blob_deleted = match self.services.storage.delete(&document.storage_key).await {
            Ok(()) => true,
            Err(err) => {
                warn!(storage_key = %document.storage_key, error = %err, "blob delete failed; continuing");
                false
            }
        };

        if !Document::delete(document_id, db).await? {
            return Err(AppError::NotFound(format!("document {document_id}")));
        }
        info!("document record deleted");

        let resync_job_id = match TenantIndex::get(tenant_id, db).await {
            Ok(Some(index)) => match self.trigger.resync(&index, "resync after delete").await {
                Ok(job_id) => Some(job_id),
                Err(err) => {
                    warn!(
                        index_id = %index.index_id,
                        error = %err,
                        "resync after delete failed; index keeps stale data until next reconciliation"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(
                    error = %err,
                    "could not load tenant index for resync; index keeps stale data until next reconciliation"
                );
                None
            }
        };

        Ok(DeleteReceipt {
            document_id: document_id.to_string(),
            deleted: true,
            blob_deleted,
            resync_job_id,
        })
    }

    /// Current status of a document. A non-terminal document triggers a
    /// reconcile first so polling clients see progress without a separate poller.
    pub async fn get_sync_status(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<SyncStatusReport, AppError> {
        validate_tenant_id(tenant_id)?;
        let db = &self.services.db;
        let document = Document::get_owned(document_id, tenant_id, db).await?;
        if document.sync_status.is_terminal() {
            return Ok(document.into());
        }

        if let Some(index) = TenantIndex::get(tenant_id, db).await? {
            if let Err(err) = self.reconciler.reconcile(&index.tenant_id).await {
                warn!(%tenant_id, %document_id, error = %err, "opportunistic reconcile failed");
            }
        }

        Ok(Document::get_owned(document_id, tenant_id, db).await?.into())
    }

    async fn bump_document_count(&self, tenant_id: &str) {
        if let Err(err) = TenantIndex::increment_document_count(tenant_id, 1, &self.services.db).await {
            warn!(%tenant_id, error = %err, "failed to bump document count");
        }
    }
}

fn upload_attributes(
    tenant_id: &str,
    document_id: &str,
    filename: &str,
    content_type: &str,
) -> BlobAttributes {
    BlobAttributes::with_content_type(content_type)
        .meta("tenant_id", tenant_id)
        .meta("document_id", document_id)
        .meta("original_filename", filename)
        .meta("upload_timestamp", Utc::now().to_rfc3339())
}
