//! Managed vector-index / knowledge-base provider.
//!
//! [`IndexProvider`] is the raw capability surface. [`ProviderClient`] layers
//! per-call-class deadlines, bounded retries and the idempotent ingestion-job
//! start on top of it; the orchestration code only talks to the client.

pub mod client;
pub mod http;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::ProviderClient;

use crate::utils::config::{AppConfig, IndexProviderKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VectorIndexSpec {
    pub bucket_name: String,
    pub index_name: String,
    pub dimension: u32,
    pub distance_metric: DistanceMetric,
    pub data_type: String,
    pub non_filterable_metadata_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseSpec {
    pub name: String,
    pub description: String,
    pub role_arn: Option<String>,
    pub embedding_model: String,
    pub vector_bucket_arn: String,
    pub vector_index_arn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingConfig {
    pub max_tokens: u32,
    pub overlap_percentage: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParsingConfig {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSpec {
    pub knowledge_base_id: String,
    pub name: String,
    pub description: String,
    pub bucket_arn: String,
    pub inclusion_prefixes: Vec<String>,
    pub chunking: ChunkingConfig,
    pub parsing: ParsingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseInfo {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceInfo {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionJobStatus {
    Starting,
    InProgress,
    Complete,
    Failed,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestionJobSummary {
    pub job_id: String,
    pub status: IngestionJobStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Readiness of a freshly created vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
    /// The provider exposes no readiness signal; callers fall back to a fixed delay.
    NoSignal,
}

#[async_trait]
pub trait IndexProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_vector_bucket(&self, bucket_name: &str) -> ProviderResult<()>;

    async fn create_vector_index(&self, spec: &VectorIndexSpec) -> ProviderResult<()>;

    async fn vector_index_readiness(
        &self,
        bucket_name: &str,
        index_name: &str,
    ) -> ProviderResult<Readiness>;

    /// Returns the provider-assigned knowledge base id.
    async fn create_knowledge_base(&self, spec: &KnowledgeBaseSpec) -> ProviderResult<String>;

    /// Returns the provider-assigned data source id.
    async fn create_data_source(&self, spec: &DataSourceSpec) -> ProviderResult<String>;

    async fn get_knowledge_base(&self, knowledge_base_id: &str)
        -> ProviderResult<KnowledgeBaseInfo>;

    async fn get_data_source(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
    ) -> ProviderResult<DataSourceInfo>;

    async fn delete_knowledge_base(&self, knowledge_base_id: &str) -> ProviderResult<()>;

    async fn delete_vector_bucket(&self, bucket_name: &str) -> ProviderResult<()>;

    /// Returns the id of the started job.
    async fn start_ingestion_job(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        description: &str,
    ) -> ProviderResult<String>;

    async fn get_ingestion_job(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        job_id: &str,
    ) -> ProviderResult<IngestionJobSummary>;

    /// Most recently started jobs first.
    async fn list_ingestion_jobs(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        max_results: usize,
    ) -> ProviderResult<Vec<IngestionJobSummary>>;

    async fn vector_count(&self, bucket_name: &str, index_name: &str) -> ProviderResult<u64>;
}

pub type DynIndexProvider = Arc<dyn IndexProvider>;

/// Builds the provider selected by configuration.
pub fn provider_from_config(cfg: &AppConfig) -> Result<DynIndexProvider, ProviderError> {
    match cfg.index_provider {
        IndexProviderKind::Http => Ok(Arc::new(http::HttpIndexProvider::new(
            &cfg.index_provider_url,
            cfg.index_provider_api_key.clone(),
        )?)),
        IndexProviderKind::Memory => Ok(Arc::new(memory::InMemoryIndexProvider::new())),
    }
}
