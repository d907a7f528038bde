use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{provider::DistanceMetric, storage::types::dispatch_task::DEFAULT_MAX_ATTEMPTS};

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
    S3,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexProviderKind {
    Http,
    Memory,
}

fn default_index_provider_kind() -> IndexProviderKind {
    IndexProviderKind::Http
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Upper bound for operation request bodies, base64 document content included.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    // Blob store
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_documents_bucket")]
    pub documents_bucket: String,
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_endpoint: Option<String>,

    // Vector index provider
    #[serde(default = "default_index_provider_kind")]
    pub index_provider: IndexProviderKind,
    #[serde(default = "default_index_provider_url")]
    pub index_provider_url: String,
    #[serde(default)]
    pub index_provider_api_key: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub knowledge_base_role_arn: Option<String>,
    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: u32,
    #[serde(default = "default_distance_metric")]
    pub distance_metric: DistanceMetric,
    #[serde(default = "default_parsing_model")]
    pub parsing_model: String,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: u32,
    #[serde(default = "default_chunk_overlap_percentage")]
    pub chunk_overlap_percentage: u8,
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_readiness_poll_interval_ms")]
    pub readiness_poll_interval_ms: u64,
    #[serde(default = "default_readiness_poll_attempts")]
    pub readiness_poll_attempts: u32,
    #[serde(default = "default_list_jobs_max_results")]
    pub list_jobs_max_results: usize,

    // Per-call-class timeouts
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    #[serde(default = "default_blob_timeout_secs")]
    pub blob_timeout_secs: u64,
    #[serde(default = "default_index_creation_timeout_secs")]
    pub index_creation_timeout_secs: u64,
    #[serde(default = "default_ingestion_timeout_secs")]
    pub ingestion_timeout_secs: u64,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,

    // Retry and worker tuning
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_task_max_attempts")]
    pub task_max_attempts: u32,
    #[serde(default = "default_worker_lease_secs")]
    pub worker_lease_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_http_port() -> u16 {
    3000
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_documents_bucket() -> String {
    "tenant-documents".to_string()
}

fn default_index_provider_url() -> String {
    "http://localhost:4566".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_resource_prefix() -> String {
    "kb".to_string()
}

fn default_embedding_model() -> String {
    "amazon.titan-embed-text-v2:0".to_string()
}

fn default_embedding_dimension() -> u32 {
    1024
}

fn default_distance_metric() -> DistanceMetric {
    DistanceMetric::Cosine
}

fn default_parsing_model() -> String {
    "anthropic.claude-3-haiku-20240307-v1:0".to_string()
}

fn default_chunk_max_tokens() -> u32 {
    500
}

fn default_chunk_overlap_percentage() -> u8 {
    10
}

fn default_settle_delay_secs() -> u64 {
    30
}

fn default_readiness_poll_interval_ms() -> u64 {
    2_000
}

fn default_readiness_poll_attempts() -> u32 {
    30
}

fn default_list_jobs_max_results() -> usize {
    10
}

fn default_metadata_timeout_secs() -> u64 {
    30
}

fn default_blob_timeout_secs() -> u64 {
    120
}

fn default_index_creation_timeout_secs() -> u64 {
    300
}

fn default_ingestion_timeout_secs() -> u64 {
    60
}

fn default_generation_timeout_secs() -> u64 {
    300
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_task_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_worker_lease_secs() -> u64 {
    900
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "orchestrator".to_string(),
            surrealdb_database: "orchestrator".to_string(),
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            max_body_bytes: default_max_body_bytes(),
            storage: default_storage_kind(),
            documents_bucket: default_documents_bucket(),
            s3_region: None,
            s3_endpoint: None,
            index_provider: default_index_provider_kind(),
            index_provider_url: default_index_provider_url(),
            index_provider_api_key: None,
            region: default_region(),
            account_id: String::new(),
            knowledge_base_role_arn: None,
            resource_prefix: default_resource_prefix(),
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
            distance_metric: default_distance_metric(),
            parsing_model: default_parsing_model(),
            chunk_max_tokens: default_chunk_max_tokens(),
            chunk_overlap_percentage: default_chunk_overlap_percentage(),
            settle_delay_secs: default_settle_delay_secs(),
            readiness_poll_interval_ms: default_readiness_poll_interval_ms(),
            readiness_poll_attempts: default_readiness_poll_attempts(),
            list_jobs_max_results: default_list_jobs_max_results(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            blob_timeout_secs: default_blob_timeout_secs(),
            index_creation_timeout_secs: default_index_creation_timeout_secs(),
            ingestion_timeout_secs: default_ingestion_timeout_secs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            task_max_attempts: default_task_max_attempts(),
            worker_lease_secs: default_worker_lease_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
