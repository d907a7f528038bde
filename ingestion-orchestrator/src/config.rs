use std::time::Duration;

use common::{provider::DistanceMetric, utils::config::AppConfig};

/// Instruction handed to the parsing model of every tenant data source.
pub const PARSING_PROMPT: &str =
    "Extract the full text of the document. Keep headings, lists and tables in reading order.";

/// Metadata key the knowledge base stores chunk text under; it must stay non-filterable.
pub const CHUNK_TEXT_METADATA_KEY: &str = "AMAZON_BEDROCK_TEXT";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub resource_prefix: String,
    pub region: String,
    pub account_id: String,
    pub documents_bucket: String,
    pub knowledge_base_role_arn: Option<String>,
    pub embedding_model: String,
    pub embedding_dimension: u32,
    pub distance_metric: DistanceMetric,
    pub parsing_model: String,
    pub chunk_max_tokens: u32,
    pub chunk_overlap_percentage: u8,
    pub settle_delay: Duration,
    pub readiness_poll_interval: Duration,
    pub readiness_poll_attempts: u32,
    pub list_jobs_max_results: usize,
    pub task_max_attempts: u32,
    pub task_retry_base: Duration,
    pub task_retry_max: Duration,
    pub worker_lease: Duration,
    pub reconcile_interval: Duration,
    pub dispatch_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            resource_prefix: cfg.resource_prefix.clone(),
            region: cfg.region.clone(),
            account_id: cfg.account_id.clone(),
            documents_bucket: cfg.documents_bucket.clone(),
            knowledge_base_role_arn: cfg.knowledge_base_role_arn.clone(),
            embedding_model: cfg.embedding_model.clone(),
            embedding_dimension: cfg.embedding_dimension,
            distance_metric: cfg.distance_metric,
            parsing_model: cfg.parsing_model.clone(),
            chunk_max_tokens: cfg.chunk_max_tokens,
            chunk_overlap_percentage: cfg.chunk_overlap_percentage,
            settle_delay: Duration::from_secs(cfg.settle_delay_secs),
            readiness_poll_interval: Duration::from_millis(cfg.readiness_poll_interval_ms),
            readiness_poll_attempts: cfg.readiness_poll_attempts,
            list_jobs_max_results: cfg.list_jobs_max_results,
            task_max_attempts: cfg.task_max_attempts,
            task_retry_base: Duration::from_secs(30),
            task_retry_max: Duration::from_secs(15 * 60),
            worker_lease: Duration::from_secs(cfg.worker_lease_secs),
            reconcile_interval: Duration::from_secs(cfg.reconcile_interval_secs),
            dispatch_timeout: Duration::from_secs(cfg.dispatch_timeout_secs),
        }
    }

    pub fn documents_bucket_arn(&self) -> String {
        format!("arn:aws:s3:::{}", self.documents_bucket)
    }

    pub fn vector_bucket_arn(&self, bucket_name: &str) -> String {
        format!(
            "arn:aws:s3vectors:{}:{}:bucket/{bucket_name}",
            self.region, self.account_id
        )
    }

    pub fn vector_index_arn(&self, bucket_name: &str, index_name: &str) -> String {
        format!("{}/index/{index_name}", self.vector_bucket_arn(bucket_name))
    }

    pub fn model_arn(&self, model: &str) -> String {
        format!("arn:aws:bedrock:{}::foundation-model/{model}", self.region)
    }

    /// Delay before redelivering a failed task, doubling per attempt up to the cap.
    pub fn task_retry_delay(&self, attempt: u32) -> Duration {
        let capped_attempt = attempt.saturating_sub(1).min(5);
        let delay = self.task_retry_base.saturating_mul(2_u32.pow(capped_attempt));
        delay.min(self.task_retry_max)
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}
