use crate::{
    error::AppError,
    utils::timeouts::{bounded, CallClass},
};

use super::types::{
    dispatch_task::DispatchTask, document::Document, tenant_index::TenantIndex, StoredObject,
};
use std::{future::IntoFuture, ops::Deref, time::Duration};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Surreal,
};

pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
    op_timeout: Duration,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// # Arguments
    ///
    /// # Returns
    /// * `SurrealDbClient` initialized
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, AppError> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient {
            client: db,
            op_timeout: DEFAULT_METADATA_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Runs a metadata-store call under the metadata deadline.
    pub async fn bounded<F, T, E>(&self, operation: &str, call: F) -> Result<T, AppError>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        bounded(self.op_timeout, CallClass::Metadata, operation, call).await
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.build_indexes().await
    }

    pub async fn build_indexes(&self) -> Result<(), AppError> {
        let statements = format!(
            "DEFINE INDEX IF NOT EXISTS idx_document_tenant ON {document} FIELDS tenant_id;
             DEFINE INDEX IF NOT EXISTS idx_document_job ON {document} FIELDS ingestion_job_id;
             DEFINE INDEX IF NOT EXISTS idx_document_job_status ON {document} FIELDS ingestion_job_id, sync_status;
             DEFINE INDEX IF NOT EXISTS idx_document_status ON {document} FIELDS sync_status;
             DEFINE INDEX IF NOT EXISTS idx_tenant_index_kb ON {tenant_index} FIELDS index_id;
             DEFINE INDEX IF NOT EXISTS idx_task_state ON {task} FIELDS state;
             DEFINE INDEX IF NOT EXISTS idx_task_scheduled ON {task} FIELDS scheduled_at;",
            document = Document::table_name(),
            tenant_index = TenantIndex::table_name(),
            task = DispatchTask::table_name(),
        );

        self.bounded("build_indexes", self.client.query(statements))
            .await?
            .check()?;
        Ok(())
    }

    /// Create a record; fails if a record with the same id already exists.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, AppError>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        let id = item.get_id().to_string();
        self.bounded(
            "store_item",
            self.client.create((T::table_name(), id)).content(item),
        )
        .await
    }

    /// Retrieve all records of a table.
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, AppError>
    where
        T: for<'de> StoredObject,
    {
        self.bounded("get_all_stored_items", self.client.select(T::table_name()))
            .await
    }

    /// Retrieve a single record by id.
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, AppError>
    where
        T: for<'de> StoredObject,
    {
        self.bounded("get_item", self.client.select((T::table_name(), id)))
            .await
    }

    /// Delete a single record by id, returning it if it existed.
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, AppError>
    where
        T: for<'de> StoredObject,
    {
        self.bounded("delete_item", self.client.delete((T::table_name(), id)))
            .await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, AppError> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient {
            client: db,
            op_timeout: DEFAULT_METADATA_TIMEOUT,
        })
    }
}
