use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::types::{document::Document, tenant_index::TenantIndex},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{
    documents::DocumentTracker,
    ingestion::IngestionTrigger,
    migrator::PendingMigrator,
    provisioning::IndexProvisioner,
    reconciler::IngestionReconciler,
    services::OrchestratorServices,
};

/// Operations accepted by the entrypoint, tagged by `operation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    GetOrCreate,
    CreateAndProcess {
        document_id: String,
        filename: String,
        temp_key: String,
    },
    ProcessPending,
    CheckIngestionStatus,
    Delete,
    Stats,
    ListAll,
    UploadDocument {
        filename: String,
        /// Base64 encoded file content.
        content: String,
    },
    ListDocuments,
    GetSyncStatus {
        document_id: String,
    },
    DeleteDocument {
        document_id: String,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetOrCreate => "get_or_create",
            Operation::CreateAndProcess { .. } => "create_and_process",
            Operation::ProcessPending => "process_pending",
            Operation::CheckIngestionStatus => "check_ingestion_status",
            Operation::Delete => "delete",
            Operation::Stats => "stats",
            Operation::ListAll => "list_all",
            Operation::UploadDocument { .. } => "upload_document",
            Operation::ListDocuments => "list_documents",
            Operation::GetSyncStatus { .. } => "get_sync_status",
            Operation::DeleteDocument { .. } => "delete_document",
        }
    }

    fn requires_tenant(&self) -> bool {
        !matches!(self, Operation::ListAll)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    #[serde(default, alias = "user_id", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(flatten)]
    pub operation: Operation,
}

impl OperationRequest {
    pub fn new(tenant_id: &str, operation: Operation) -> Self {
        Self {
            tenant_id: Some(tenant_id.to_string()),
            operation,
        }
    }
}

/// Status code plus JSON body: 200 on success, 4xx for caller mistakes, 500 otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResponse {
    pub status_code: u16,
    pub body: Value,
}

impl OperationResponse {
    fn ok(body: Value) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    fn from_error(operation: &str, tenant_id: Option<&str>, err: &AppError) -> Self {
        let status_code = err.status_code();
        let message = if status_code >= 500 {
            error!(operation, tenant_id = tenant_id.unwrap_or(""), error = %err, "operation failed");
            "Internal server error".to_string()
        } else {
            warn!(operation, tenant_id = tenant_id.unwrap_or(""), error = %err, "operation rejected");
            err.public_message()
        };
        Self {
            status_code,
            body: json!({ "error": message, "status": status_code }),
        }
    }
}

/// Public view of a tenant index record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexView {
    pub tenant_id: String,
    pub knowledge_base_id: String,
    pub data_source_id: String,
    pub vector_bucket_name: String,
    pub vector_index_name: String,
    pub knowledge_base_name: String,
    pub tenant_hash: String,
    pub document_count: i64,
    pub created_at: DateTime<Utc>,
}

impl From<TenantIndex> for IndexView {
    fn from(index: TenantIndex) -> Self {
        Self {
            tenant_id: index.tenant_id,
            knowledge_base_id: index.index_id,
            data_source_id: index.ingest_source_id,
            vector_bucket_name: index.vector_bucket_name,
            vector_index_name: index.vector_index_name,
            knowledge_base_name: index.knowledge_base_name,
            tenant_hash: index.tenant_hash,
            document_count: index.document_count,
            created_at: index.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentView {
    pub document_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub storage_key: String,
    pub sync_status: String,
    pub ingestion_job_id: Option<String>,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Document> for DocumentView {
    fn from(document: Document) -> Self {
        Self {
            document_id: document.id,
            filename: document.filename,
            content_type: document.content_type,
            size: document.size,
            storage_key: document.storage_key,
            sync_status: document.sync_status.as_str().to_string(),
            ingestion_job_id: document.ingestion_job_id,
            status_message: document.status_message,
            error_message: document.error_message,
            created_at: document.created_at,
            updated_at: document.updated_at,
        }
    }
}

/// Entrypoint for every tenant-index and document operation.
#[derive(Clone)]
pub struct Orchestrator {
    services: Arc<OrchestratorServices>,
    provisioner: IndexProvisioner,
    migrator: PendingMigrator,
    reconciler: IngestionReconciler,
    documents: DocumentTracker,
}

impl Orchestrator {
    pub fn new(services: OrchestratorServices) -> Self {
        let services = Arc::new(services);
        let trigger = IngestionTrigger::new(Arc::clone(&services));
        let migrator = PendingMigrator::new(Arc::clone(&services), trigger.clone());
        let provisioner = IndexProvisioner::new(Arc::clone(&services), migrator.clone());
        let reconciler = IngestionReconciler::new(Arc::clone(&services));
        let documents = DocumentTracker::new(
            Arc::clone(&services),
            provisioner.clone(),
            trigger,
            reconciler.clone(),
        );

        Self {
            services,
            provisioner,
            migrator,
            reconciler,
            documents,
        }
    }

    pub fn services(&self) -> &OrchestratorServices {
        &self.services
    }

    pub fn provisioner(&self) -> &IndexProvisioner {
        &self.provisioner
    }

    pub fn documents(&self) -> &DocumentTracker {
        &self.documents
    }

    pub fn reconciler(&self) -> &IngestionReconciler {
        &self.reconciler
    }

    /// Decodes a raw JSON request and handles it. Malformed input is a 400.
    pub async fn handle_value(&self, raw: Value) -> OperationResponse {
        match serde_json::from_value::<OperationRequest>(raw) {
            Ok(request) => self.handle(request).await,
            Err(err) => OperationResponse::from_error(
                "unknown",
                None,
                &AppError::Validation(format!("invalid request: {err}")),
            ),
        }
    }

    pub async fn handle(&self, request: OperationRequest) -> OperationResponse {
        let operation = request.operation.name();
        let tenant_id = request.tenant_id.clone();
        match self.execute(request).await {
            Ok(body) => OperationResponse::ok(body),
            Err(err) => OperationResponse::from_error(operation, tenant_id.as_deref(), &err),
        }
    }

    /// Runs one operation and returns its JSON result.
    pub async fn execute(&self, request: OperationRequest) -> Result<Value, AppError> {
        let OperationRequest {
            tenant_id,
            operation,
        } = request;
        let tenant_id = match tenant_id {
            Some(id) if !id.trim().is_empty() => id,
            _ if operation.requires_tenant() => {
                return Err(AppError::Validation("tenant_id is required".to_string()))
            }
            _ => String::new(),
        };
        info!(operation = operation.name(), %tenant_id, "executing operation");

        let body = match operation {
            Operation::GetOrCreate => {
                let index = self.provisioner.get_or_create(&tenant_id).await?;
                response_body(IndexView::from(index))?
            }
            Operation::CreateAndProcess {
                document_id,
                filename,
                temp_key,
            } => {
                let outcome = self
                    .documents
                    .create_and_process(&tenant_id, &document_id, &filename, &temp_key)
                    .await?;
                response_body(outcome)?
            }
            Operation::ProcessPending => {
                let index = self.provisioner.get_existing(&tenant_id).await?.ok_or_else(|| {
                    AppError::NotFound(format!("knowledge base for tenant {tenant_id}"))
                })?;
                response_body(self.migrator.migrate_pending(&index).await?)?
            }
            Operation::CheckIngestionStatus => {
                response_body(self.reconciler.reconcile(&tenant_id).await?)?
            }
            Operation::Delete => {
                let deleted = self.provisioner.delete(&tenant_id).await?;
                json!({ "tenant_id": tenant_id, "deleted": deleted })
            }
            Operation::Stats => response_body(self.provisioner.stats(&tenant_id).await?)?,
            Operation::ListAll => {
                let indexes: Vec<IndexView> = self
                    .provisioner
                    .list_all()
                    .await?
                    .into_iter()
                    .map(IndexView::from)
                    .collect();
                json!({ "count": indexes.len(), "indexes": indexes })
            }
            Operation::UploadDocument { filename, content } => {
                let content = STANDARD
                    .decode(content.as_bytes())
                    .map_err(|err| AppError::Validation(format!("content is not base64: {err}")))?;
                let receipt = self
                    .documents
                    .process_document(&tenant_id, &filename, Bytes::from(content))
                    .await?;
                response_body(receipt)?
            }
            Operation::ListDocuments => {
                let documents: Vec<DocumentView> = self
                    .documents
                    .list_documents(&tenant_id)
                    .await?
                    .into_iter()
                    .map(DocumentView::from)
                    .collect();
                json!({ "count": documents.len(), "documents": documents })
            }
            Operation::GetSyncStatus { document_id } => response_body(
                self.documents
                    .get_sync_status(&tenant_id, &document_id)
                    .await?,
            )?,
            Operation::DeleteDocument { document_id } => response_body(
                self.documents
                    .delete_document(&tenant_id, &document_id)
                    .await?,
            )?,
        };
        Ok(body)
    }

    /// Called when a queued request will not be delivered again, so the
    /// document it was working on reaches a terminal state.
    pub async fn abandon(&self, request: &OperationRequest, err: &AppError) {
        if let (
            Some(tenant_id),
            Operation::CreateAndProcess { document_id, .. },
        ) = (request.tenant_id.as_deref(), &request.operation)
        {
            self.documents
                .fail_document(tenant_id, document_id, err)
                .await;
        }
    }
}

/// Encodes an operation result. A result that cannot be encoded is our fault,
/// never the caller's.
fn response_body<T: Serialize>(value: T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|err| AppError::InternalError(format!("could not encode response: {err}")))
}
