use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::debug;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TenantIndexStatus {
    #[default]
    Active,
}

stored_object!(TenantIndex, "tenant_index", {
    tenant_id: String,
    tenant_hash: String,
    index_id: String,
    ingest_source_id: String,
    knowledge_base_name: String,
    vector_bucket_name: String,
    vector_index_name: String,
    #[serde(default)]
    status: TenantIndexStatus,
    #[serde(default)]
    document_count: i64
});

/// Result of a first-writer-wins create.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(TenantIndex),
    /// Another writer got there first; carries the stored record.
    Existing(TenantIndex),
}

impl TenantIndex {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: &str,
        tenant_hash: &str,
        index_id: String,
        ingest_source_id: String,
        knowledge_base_name: String,
        vector_bucket_name: String,
        vector_index_name: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            // Keyed by tenant so at most one record can exist per tenant.
            id: tenant_id.to_string(),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.to_string(),
            tenant_hash: tenant_hash.to_string(),
            index_id,
            ingest_source_id,
            knowledge_base_name,
            vector_bucket_name,
            vector_index_name,
            status: TenantIndexStatus::Active,
            document_count: 0,
        }
    }

    pub async fn get(tenant_id: &str, db: &SurrealDbClient) -> Result<Option<Self>, AppError> {
        db.get_item::<Self>(tenant_id).await
    }

    /// Persists the record unless one already exists for the tenant, in which
    /// case the stored record wins and is returned.
    pub async fn create_if_absent(self, db: &SurrealDbClient) -> Result<CreateOutcome, AppError> {
        let tenant_id = self.tenant_id.clone();
        match db.store_item(self).await {
            Ok(Some(created)) => Ok(CreateOutcome::Created(created)),
            Ok(None) => Err(AppError::InternalError(format!(
                "create of index record for tenant {tenant_id} returned nothing"
            ))),
            Err(err) => match Self::get(&tenant_id, db).await? {
                Some(existing) => {
                    debug!(%tenant_id, error = %err, "index record already present");
                    Ok(CreateOutcome::Existing(existing))
                }
                None => Err(err),
            },
        }
    }

    /// Returns whether a record was removed.
    pub async fn delete(tenant_id: &str, db: &SurrealDbClient) -> Result<bool, AppError> {
        Ok(db.delete_item::<Self>(tenant_id).await?.is_some())
    }

    pub async fn list_all(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut records: Vec<Self> = db.get_all_stored_items().await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Atomically adds `delta` to the tenant's document counter.
    pub async fn increment_document_count(
        tenant_id: &str,
        delta: i64,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let query = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET document_count += $delta, updated_at = $now
                 RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", tenant_id.to_string()))
            .bind(("delta", delta))
            .bind(("now", SurrealDatetime::from(Utc::now())));

        let mut result = db.bounded("increment_document_count", query).await?;
        let updated: Option<Self> = result.take(0)?;
        Ok(updated)
    }
}
