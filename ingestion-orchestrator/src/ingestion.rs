use std::sync::Arc;

use common::{
    error::AppError,
    storage::types::{
        document::{Document, DocumentChanges},
        sync_status::SyncEvent,
        tenant_index::TenantIndex,
    },
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::OrchestratorServices;

/// What happened when ingestion was requested for a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started { job_id: String },
    Failed { error: String },
}

/// Starts provider ingestion jobs and records them on documents.
#[derive(Clone)]
pub struct IngestionTrigger {
    services: Arc<OrchestratorServices>,
}

impl IngestionTrigger {
    pub fn new(services: Arc<OrchestratorServices>) -> Self {
        Self { services }
    }

    /// Starts one job over the tenant's data source. The description carries a
    /// fresh token so a retried start can find an attempt that already landed.
    pub async fn start_job(&self, index: &TenantIndex, reason: &str) -> Result<String, AppError> {
        let description = format!("{reason} {}", Uuid::new_v4());
        let job_id = self
            .services
            .provider
            .start_ingestion_job(&index.index_id, &index.ingest_source_id, &description)
            .await?;

        info!(
            tenant_id = %index.tenant_id,
            index_id = %index.index_id,
            %job_id,
            reason,
            "ingestion job started"
        );
        Ok(job_id)
    }

    /// Starts ingestion for a placed document and moves it to `syncing`. A
    /// provider failure marks the document `failed` but is not returned as an
    /// error: the upload itself already succeeded.
    pub async fn trigger_for_document(
        &self,
        index: &TenantIndex,
        document_id: &str,
    ) -> Result<TriggerOutcome, AppError> {
        match self.start_job(index, &format!("document {document_id}")).await {
            Ok(job_id) => {
                let changes = DocumentChanges {
                    ingestion_job_id: Some(job_id.clone()),
                    status_message: Some("Ingestion started".to_string()),
                    ..Default::default()
                };
                let updated = Document::transition(
                    document_id,
                    SyncEvent::StartSync,
                    changes,
                    &self.services.db,
                )
                .await?;
                if updated.is_some() {
                    info!(
                        tenant_id = %index.tenant_id,
                        %document_id,
                        %job_id,
                        "document syncing"
                    );
                }
                Ok(TriggerOutcome::Started { job_id })
            }
            Err(err) => {
                let error = format!("Failed to start ingestion: {err}");
                warn!(
                    tenant_id = %index.tenant_id,
                    %document_id,
                    index_id = %index.index_id,
                    error = %err,
                    "ingestion trigger failed; document marked failed"
                );
                Document::transition(
                    document_id,
                    SyncEvent::Fail,
                    DocumentChanges::error(error.clone()),
                    &self.services.db,
                )
                .await?;
                Ok(TriggerOutcome::Failed { error })
            }
        }
    }

    /// Full re-sync of the tenant's data source, used after a deletion so the
    /// index drops vectors of removed documents.
    pub async fn resync(&self, index: &TenantIndex, reason: &str) -> Result<String, AppError> {
        self.start_job(index, reason).await
    }
}
