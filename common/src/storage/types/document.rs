use std::collections::BTreeSet;

use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::debug;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::sync_status::{SyncEvent, SyncStatus};

stored_object!(Document, "document", {
    tenant_id: String,
    filename: String,
    content_type: String,
    size: u64,
    storage_key: String,
    #[serde(default)]
    index_id: Option<String>,
    #[serde(default)]
    ingest_source_id: Option<String>,
    sync_status: SyncStatus,
    #[serde(default)]
    ingestion_job_id: Option<String>,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    error_message: Option<String>
});

/// Field updates applied together with a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentChanges {
    pub storage_key: Option<String>,
    pub index_id: Option<String>,
    pub ingest_source_id: Option<String>,
    pub ingestion_job_id: Option<String>,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
}

impl DocumentChanges {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            status_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

impl Document {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        tenant_id: &str,
        filename: &str,
        content_type: &str,
        size: u64,
        storage_key: String,
        sync_status: SyncStatus,
        status_message: Option<String>,
    ) -> Result<Self, AppError> {
        if !sync_status.is_entry_state() {
            return Err(AppError::InvalidTransition(format!(
                "documents cannot be created in status {sync_status}"
            )));
        }

        let now = Utc::now();
        Ok(Self {
            id,
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.to_string(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            size,
            storage_key,
            index_id: None,
            ingest_source_id: None,
            sync_status,
            ingestion_job_id: None,
            status_message,
            error_message: None,
        })
    }

    pub async fn insert(self, db: &SurrealDbClient) -> Result<Self, AppError> {
        let id = self.id.clone();
        db.store_item(self).await?.ok_or_else(|| {
            AppError::InternalError(format!("create of document {id} returned nothing"))
        })
    }

    pub async fn get(document_id: &str, db: &SurrealDbClient) -> Result<Option<Self>, AppError> {
        db.get_item::<Self>(document_id).await
    }

    /// Loads a document, refusing to reveal one that belongs to another tenant.
    pub async fn get_owned(
        document_id: &str,
        tenant_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let document = Self::get(document_id, db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {document_id}")))?;

        if document.tenant_id != tenant_id {
            return Err(AppError::Ownership(format!("document {document_id}")));
        }
        Ok(document)
    }

    pub async fn delete(document_id: &str, db: &SurrealDbClient) -> Result<bool, AppError> {
        Ok(db.delete_item::<Self>(document_id).await?.is_some())
    }

    /// Newest first.
    pub async fn list_for_tenant(
        tenant_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let query = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id
                 ORDER BY created_at DESC",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_string()));

        let documents: Vec<Self> = db.bounded("list_documents", query).await?.take(0)?;
        Ok(documents)
    }

    pub async fn count_for_tenant(tenant_id: &str, db: &SurrealDbClient) -> Result<i64, AppError> {
        let query = db
            .client
            .query(
                "SELECT count() AS count FROM type::table($table)
                 WHERE tenant_id = $tenant_id
                 GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_string()));

        let row: Option<CountRow> = db.bounded("count_documents", query).await?.take(0)?;
        Ok(row.map_or(0, |r| r.count))
    }

    /// Documents of the tenant attached to `job_id` whose status is one of `statuses`.
    pub async fn find_by_job(
        tenant_id: &str,
        job_id: &str,
        statuses: &[SyncStatus],
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let query = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE ingestion_job_id = $job_id
                   AND sync_status IN $statuses
                   AND tenant_id = $tenant_id",
            )
            .bind(("table", Self::table_name()))
            .bind(("job_id", job_id.to_string()))
            .bind(("statuses", status_strings(statuses)))
            .bind(("tenant_id", tenant_id.to_string()));

        let documents: Vec<Self> = db.bounded("find_documents_by_job", query).await?.take(0)?;
        Ok(documents)
    }

    /// Distinct ingestion job ids still referenced by in-flight documents of the tenant.
    pub async fn in_flight_job_ids(
        tenant_id: &str,
        db: &SurrealDbClient,
    ) -> Result<BTreeSet<String>, AppError> {
        let query = db
            .client
            .query(
                "SELECT VALUE ingestion_job_id FROM type::table($table)
                 WHERE tenant_id = $tenant_id
                   AND sync_status IN $statuses
                   AND ingestion_job_id != NONE",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("statuses", status_strings(&SyncStatus::IN_FLIGHT)));

        let ids: Vec<Option<String>> = db.bounded("in_flight_job_ids", query).await?.take(0)?;
        Ok(ids.into_iter().flatten().collect())
    }

    /// Tenants that have at least one document with a running ingestion job.
    pub async fn tenants_with_in_flight(
        db: &SurrealDbClient,
    ) -> Result<BTreeSet<String>, AppError> {
        let query = db
            .client
            .query(
                "SELECT VALUE tenant_id FROM type::table($table)
                 WHERE sync_status IN $statuses",
            )
            .bind(("table", Self::table_name()))
            .bind(("statuses", status_strings(&SyncStatus::IN_FLIGHT)));

        let tenants: Vec<String> = db.bounded("tenants_with_in_flight", query).await?.take(0)?;
        Ok(tenants.into_iter().collect())
    }

    /// Applies `event` together with `changes`, but only if the stored status is
    /// still one from which `event` is legal. Returns `None` when the guard did
    /// not match (record missing or moved on concurrently); terminal documents are
    /// therefore never regressed.
    pub async fn transition(
        document_id: &str,
        event: SyncEvent,
        changes: DocumentChanges,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let sources = SyncStatus::sources_for(event);
        let Some(next) = sources.first().map(|s| s.apply(event)).transpose()? else {
            return Err(AppError::InvalidTransition(format!(
                "no status accepts {}",
                event.as_str()
            )));
        };

        let mut assignments = vec!["sync_status = $next", "updated_at = $now"];
        if changes.storage_key.is_some() {
            assignments.push("storage_key = $storage_key");
        }
        if changes.index_id.is_some() {
            assignments.push("index_id = $index_id");
        }
        if changes.ingest_source_id.is_some() {
            assignments.push("ingest_source_id = $ingest_source_id");
        }
        if changes.ingestion_job_id.is_some() {
            assignments.push("ingestion_job_id = $ingestion_job_id");
        }
        if changes.status_message.is_some() {
            assignments.push("status_message = $status_message");
        }
        if changes.error_message.is_some() {
            assignments.push("error_message = $error_message");
        }

        let sql = format!(
            "UPDATE type::thing($table, $id)
             SET {}
             WHERE sync_status IN $sources
             RETURN AFTER;",
            assignments.join(", ")
        );

        let mut query = db
            .client
            .query(sql)
            .bind(("table", Self::table_name()))
            .bind(("id", document_id.to_string()))
            .bind(("next", next.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("sources", status_strings(&sources)));

        if let Some(value) = changes.storage_key {
            query = query.bind(("storage_key", value));
        }
        if let Some(value) = changes.index_id {
            query = query.bind(("index_id", value));
        }
        if let Some(value) = changes.ingest_source_id {
            query = query.bind(("ingest_source_id", value));
        }
        if let Some(value) = changes.ingestion_job_id {
            query = query.bind(("ingestion_job_id", value));
        }
        if let Some(value) = changes.status_message {
            query = query.bind(("status_message", value));
        }
        if let Some(value) = changes.error_message {
            query = query.bind(("error_message", value));
        }

        let mut result = db.bounded("document_transition", query).await?;
        let updated: Option<Self> = result.take(0)?;
        if updated.is_none() {
            debug!(
                %document_id,
                event = event.as_str(),
                "transition guard did not match; document unchanged"
            );
        }
        Ok(updated)
    }
}

fn status_strings(statuses: &[SyncStatus]) -> Vec<&'static str> {
    statuses.iter().map(SyncStatus::as_str).collect()
}
