use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    provider::{
        ChunkingConfig, DataSourceSpec, KnowledgeBaseSpec, ParsingConfig, Readiness,
        VectorIndexSpec,
    },
    storage::{
        paths::{tenant_docs_prefix, tenant_hash, validate_tenant_id},
        types::{
            document::Document,
            tenant_index::{CreateOutcome, TenantIndex},
        },
    },
};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::{CHUNK_TEXT_METADATA_KEY, PARSING_PROMPT},
    migrator::PendingMigrator,
    services::OrchestratorServices,
};

/// Provider resource names for one provisioning attempt. The knowledge base
/// and vector bucket carry a time salt so no two attempts share them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionNames {
    pub tenant_hash: String,
    pub knowledge_base: String,
    pub vector_bucket: String,
    pub vector_index: String,
    pub data_source: String,
}

impl ProvisionNames {
    pub fn derive(prefix: &str, tenant_hash: &str, now: DateTime<Utc>) -> Self {
        let salt: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
        let suffix = format!("{}-{salt}", now.timestamp());
        Self {
            tenant_hash: tenant_hash.to_string(),
            knowledge_base: format!("{prefix}-kb-{tenant_hash}-{suffix}"),
            vector_bucket: format!("{prefix}-vectors-{tenant_hash}-{suffix}"),
            vector_index: format!("{prefix}-index-{tenant_hash}"),
            data_source: format!("{prefix}-docs-{tenant_hash}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub tenant_id: String,
    pub knowledge_base_id: String,
    pub status: String,
    pub data_source_id: String,
    pub data_source_status: String,
    /// Best-effort counter kept on the index record.
    pub document_count: i64,
    /// Documents currently recorded for the tenant.
    pub live_document_count: i64,
    pub vector_count: Option<u64>,
    pub vector_bucket: String,
    pub vector_index: String,
    pub created_at: DateTime<Utc>,
}

/// Owns the lifecycle of each tenant's isolated knowledge base.
#[derive(Clone)]
pub struct IndexProvisioner {
    services: Arc<OrchestratorServices>,
    migrator: PendingMigrator,
}

impl IndexProvisioner {
    pub fn new(services: Arc<OrchestratorServices>, migrator: PendingMigrator) -> Self {
        Self { services, migrator }
    }

    /// The tenant's index if both the record and the provider resource exist.
    /// A record whose knowledge base the provider no longer knows is removed.
    pub async fn get_existing(&self, tenant_id: &str) -> Result<Option<TenantIndex>, AppError> {
        let db = &self.services.db;
        let Some(record) = TenantIndex::get(tenant_id, db).await? else {
            return Ok(None);
        };

        if self
            .services
            .provider
            .knowledge_base_exists(&record.index_id)
            .await?
        {
            return Ok(Some(record));
        }

        warn!(
            %tenant_id,
            index_id = %record.index_id,
            "knowledge base missing at provider; removing stale record"
        );
        TenantIndex::delete(tenant_id, db).await?;
        Ok(None)
    }

    #[instrument(skip(self), fields(%tenant_id))]
    pub async fn get_or_create(&self, tenant_id: &str) -> Result<TenantIndex, AppError> {
        validate_tenant_id(tenant_id)?;
        if let Some(existing) = self.get_existing(tenant_id).await? {
            debug!(index_id = %existing.index_id, "reusing tenant index");
            return Ok(existing);
        }
        self.create(tenant_id).await
    }

    async fn create(&self, tenant_id: &str) -> Result<TenantIndex, AppError> {
        let hash = tenant_hash(tenant_id);
        let names = ProvisionNames::derive(&self.services.settings.resource_prefix, &hash, Utc::now());
        info!(
            %tenant_id,
            knowledge_base = %names.knowledge_base,
            vector_bucket = %names.vector_bucket,
            "provisioning tenant index"
        );

        let mut created_kb = None;
        let (index_id, ingest_source_id) =
            match self.provision_resources(tenant_id, &names, &mut created_kb).await {
                Ok(ids) => ids,
                Err(err) => {
                    error!(%tenant_id, error = %err, "index provisioning failed; cleaning up");
                    self.teardown(tenant_id, created_kb.as_deref(), &names.vector_bucket)
                        .await;
                    return Err(err);
                }
            };

        let record = TenantIndex::new(
            tenant_id,
            &hash,
            index_id.clone(),
            ingest_source_id,
            names.knowledge_base.clone(),
            names.vector_bucket.clone(),
            names.vector_index.clone(),
        );

        match record.create_if_absent(&self.services.db).await {
            Ok(CreateOutcome::Created(created)) => {
                info!(%tenant_id, index_id = %created.index_id, "tenant index created");
                match self.migrator.migrate_pending(&created).await {
                    Ok(report) if !report.migrated.is_empty() => {
                        info!(%tenant_id, migrated = report.migrated.len(), "pending documents handed to ingestion");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%tenant_id, error = %err, "pending migration failed after index creation");
                    }
                }
                Ok(created)
            }
            Ok(CreateOutcome::Existing(winner)) => {
                info!(
                    %tenant_id,
                    index_id = %winner.index_id,
                    discarded = %index_id,
                    "concurrent provisioning lost; reusing the stored index"
                );
                self.teardown(tenant_id, Some(&index_id), &names.vector_bucket)
                    .await;
                Ok(winner)
            }
            Err(err) => {
                error!(
                    %tenant_id,
                    %index_id,
                    vector_bucket = %names.vector_bucket,
                    error = %err,
                    "failed to persist tenant index; provider resources are orphaned"
                );
                Err(err)
            }
        }
    }

    async fn provision_resources(
        &self,
        tenant_id: &str,
        names: &ProvisionNames,
        created_kb: &mut Option<String>,
    ) -> Result<(String, String), AppError> {
        let settings = &self.services.settings;
        let provider = &self.services.provider;

        provider.ensure_vector_bucket(&names.vector_bucket).await?;
        provider
            .ensure_vector_index(&VectorIndexSpec {
                bucket_name: names.vector_bucket.clone(),
                index_name: names.vector_index.clone(),
                dimension: settings.embedding_dimension,
                distance_metric: settings.distance_metric,
                data_type: "float32".to_string(),
                non_filterable_metadata_keys: vec![CHUNK_TEXT_METADATA_KEY.to_string()],
            })
            .await?;

        self.wait_until_ready(tenant_id, names).await?;

        let index_id = provider
            .create_knowledge_base(&KnowledgeBaseSpec {
                name: names.knowledge_base.clone(),
                description: format!("Knowledge base for tenant {}", names.tenant_hash),
                role_arn: settings.knowledge_base_role_arn.clone(),
                embedding_model: settings.model_arn(&settings.embedding_model),
                vector_bucket_arn: settings.vector_bucket_arn(&names.vector_bucket),
                vector_index_arn: settings.vector_index_arn(&names.vector_bucket, &names.vector_index),
            })
            .await?;
        *created_kb = Some(index_id.clone());

        // The prefix filter is the only thing keeping tenants apart in the shared bucket.
        let ingest_source_id = provider
            .create_data_source(&DataSourceSpec {
                knowledge_base_id: index_id.clone(),
                name: names.data_source.clone(),
                description: format!("Documents of tenant {}", names.tenant_hash),
                bucket_arn: settings.documents_bucket_arn(),
                inclusion_prefixes: vec![tenant_docs_prefix(&names.tenant_hash)],
                chunking: ChunkingConfig {
                    max_tokens: settings.chunk_max_tokens,
                    overlap_percentage: settings.chunk_overlap_percentage,
                },
                parsing: ParsingConfig {
                    model: settings.model_arn(&settings.parsing_model),
                    prompt: PARSING_PROMPT.to_string(),
                },
            })
            .await?;

        Ok((index_id, ingest_source_id))
    }

    /// Polls the vector index while the provider reports a readiness signal;
    /// without one, waits the fixed settle delay instead.
    async fn wait_until_ready(&self, tenant_id: &str, names: &ProvisionNames) -> Result<(), AppError> {
        let settings = &self.services.settings;
        for attempt in 1..=settings.readiness_poll_attempts.max(1) {
            let readiness = self
                .services
                .provider
                .vector_index_readiness(&names.vector_bucket, &names.vector_index)
                .await?;
            match readiness {
                Readiness::Ready => {
                    debug!(%tenant_id, attempt, "vector index ready");
                    return Ok(());
                }
                Readiness::NoSignal => {
                    debug!(
                        %tenant_id,
                        settle_ms = u64::try_from(settings.settle_delay.as_millis()).unwrap_or(u64::MAX),
                        "no readiness signal; waiting settle delay"
                    );
                    sleep(settings.settle_delay).await;
                    return Ok(());
                }
                Readiness::NotReady => {
                    debug!(%tenant_id, attempt, "vector index not ready yet");
                    sleep(settings.readiness_poll_interval).await;
                }
            }
        }

        Err(AppError::ProviderTransient(format!(
            "vector index {} not ready after {} polls",
            names.vector_index, settings.readiness_poll_attempts
        )))
    }

    /// Best-effort removal of resources from a failed or discarded attempt.
    async fn teardown(&self, tenant_id: &str, knowledge_base_id: Option<&str>, vector_bucket: &str) {
        let provider = &self.services.provider;
        if let Some(knowledge_base_id) = knowledge_base_id {
            if let Err(err) = provider.delete_knowledge_base(knowledge_base_id).await {
                warn!(%tenant_id, %knowledge_base_id, error = %err, "cleanup of knowledge base failed");
            }
        }
        if let Err(err) = provider.delete_vector_bucket(vector_bucket).await {
            warn!(%tenant_id, %vector_bucket, error = %err, "cleanup of vector bucket failed");
        }
    }

    /// Removes the tenant's knowledge base, its vector bucket and the record.
    /// Returns `false` when the tenant had no index.
    #[instrument(skip(self), fields(%tenant_id))]
    pub async fn delete(&self, tenant_id: &str) -> Result<bool, AppError> {
        validate_tenant_id(tenant_id)?;
        let db = &self.services.db;
        let Some(record) = TenantIndex::get(tenant_id, db).await? else {
            info!("no tenant index to delete");
            return Ok(false);
        };

        self.services
            .provider
            .delete_knowledge_base(&record.index_id)
            .await?;
        if let Err(err) = self
            .services
            .provider
            .delete_vector_bucket(&record.vector_bucket_name)
            .await
        {
            warn!(
                vector_bucket = %record.vector_bucket_name,
                error = %err,
                "failed to delete vector bucket"
            );
        }
        TenantIndex::delete(tenant_id, db).await?;

        info!(index_id = %record.index_id, "tenant index deleted");
        Ok(true)
    }

    pub async fn stats(&self, tenant_id: &str) -> Result<IndexStats, AppError> {
        validate_tenant_id(tenant_id)?;
        let db = &self.services.db;
        let provider = &self.services.provider;
        let record = TenantIndex::get(tenant_id, db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("knowledge base for tenant {tenant_id}")))?;

        let knowledge_base = provider.get_knowledge_base(&record.index_id).await?;
        let data_source = provider
            .get_data_source(&record.index_id, &record.ingest_source_id)
            .await?;
        let live_document_count = Document::count_for_tenant(tenant_id, db).await?;
        let vector_count = match provider
            .vector_count(&record.vector_bucket_name, &record.vector_index_name)
            .await
        {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(%tenant_id, error = %err, "vector count unavailable");
                None
            }
        };

        Ok(IndexStats {
            tenant_id: record.tenant_id,
            knowledge_base_id: record.index_id,
            status: knowledge_base.status,
            data_source_id: record.ingest_source_id,
            data_source_status: data_source.status,
            document_count: record.document_count,
            live_document_count,
            vector_count,
            vector_bucket: record.vector_bucket_name,
            vector_index: record.vector_index_name,
            created_at: record.created_at,
        })
    }

    pub async fn list_all(&self) -> Result<Vec<TenantIndex>, AppError> {
        TenantIndex::list_all(&self.services.db).await
    }
}
