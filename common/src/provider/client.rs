use tracing::{info, warn};

use super::{
    DataSourceInfo, DataSourceSpec, DynIndexProvider, IngestionJobSummary, KnowledgeBaseInfo,
    KnowledgeBaseSpec, ProviderError, Readiness, VectorIndexSpec,
};
use crate::{
    error::AppError,
    utils::timeouts::{with_retry, CallClass, RetryPolicy, TimeoutConfig},
};

/// Deadline- and retry-aware façade over an [`super::IndexProvider`].
///
/// Reads and idempotent deletes are retried on transient failures. Creations
/// are attempted once; the caller owns cleanup of whatever was created.
#[derive(Clone)]
pub struct ProviderClient {
    inner: DynIndexProvider,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
}

impl ProviderClient {
    pub fn new(inner: DynIndexProvider, timeouts: TimeoutConfig, retry: RetryPolicy) -> Self {
        Self {
            inner,
            timeouts,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Creates the vector bucket; an existing bucket of the same name is accepted.
    pub async fn ensure_vector_bucket(&self, bucket_name: &str) -> Result<(), AppError> {
        let result = self
            .timeouts
            .run(
                CallClass::IndexCreation,
                "create_vector_bucket",
                async { Ok::<_, AppError>(self.inner.create_vector_bucket(bucket_name).await) },
            )
            .await?;
        accept_existing(result, bucket_name)
    }

    /// Creates the vector index; an existing index of the same name is accepted.
    pub async fn ensure_vector_index(&self, spec: &VectorIndexSpec) -> Result<(), AppError> {
        let result = self
            .timeouts
            .run(
                CallClass::IndexCreation,
                "create_vector_index",
                async { Ok::<_, AppError>(self.inner.create_vector_index(spec).await) },
            )
            .await?;
        accept_existing(result, &spec.index_name)
    }

    pub async fn vector_index_readiness(
        &self,
        bucket_name: &str,
        index_name: &str,
    ) -> Result<Readiness, AppError> {
        with_retry(&self.retry, "vector_index_readiness", || {
            self.timeouts.run(
                CallClass::IndexCreation,
                "vector_index_readiness",
                self.inner.vector_index_readiness(bucket_name, index_name),
            )
        })
        .await
    }

    pub async fn create_knowledge_base(&self, spec: &KnowledgeBaseSpec) -> Result<String, AppError> {
        self.timeouts
            .run(
                CallClass::IndexCreation,
                "create_knowledge_base",
                self.inner.create_knowledge_base(spec),
            )
            .await
    }

    pub async fn create_data_source(&self, spec: &DataSourceSpec) -> Result<String, AppError> {
        self.timeouts
            .run(
                CallClass::IndexCreation,
                "create_data_source",
                self.inner.create_data_source(spec),
            )
            .await
    }

    pub async fn get_knowledge_base(
        &self,
        knowledge_base_id: &str,
    ) -> Result<KnowledgeBaseInfo, AppError> {
        with_retry(&self.retry, "get_knowledge_base", || {
            self.timeouts.run(
                CallClass::Metadata,
                "get_knowledge_base",
                self.inner.get_knowledge_base(knowledge_base_id),
            )
        })
        .await
    }

    /// `Ok(false)` only when the provider positively reports the knowledge base
    /// as missing. Any other failure propagates so callers never drop records
    /// on an uncertain answer.
    pub async fn knowledge_base_exists(&self, knowledge_base_id: &str) -> Result<bool, AppError> {
        match self.get_knowledge_base(knowledge_base_id).await {
            Ok(_) => Ok(true),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn get_data_source(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
    ) -> Result<DataSourceInfo, AppError> {
        with_retry(&self.retry, "get_data_source", || {
            self.timeouts.run(
                CallClass::Metadata,
                "get_data_source",
                self.inner.get_data_source(knowledge_base_id, data_source_id),
            )
        })
        .await
    }

    /// Deletes the knowledge base. Returns `false` when it was already gone.
    pub async fn delete_knowledge_base(&self, knowledge_base_id: &str) -> Result<bool, AppError> {
        let result = with_retry(&self.retry, "delete_knowledge_base", || {
            self.timeouts.run(
                CallClass::IndexCreation,
                "delete_knowledge_base",
                self.inner.delete_knowledge_base(knowledge_base_id),
            )
        })
        .await;
        missing_is_done(result)
    }

    /// Deletes the vector bucket. Returns `false` when it was already gone.
    pub async fn delete_vector_bucket(&self, bucket_name: &str) -> Result<bool, AppError> {
        let result = with_retry(&self.retry, "delete_vector_bucket", || {
            self.timeouts.run(
                CallClass::IndexCreation,
                "delete_vector_bucket",
                self.inner.delete_vector_bucket(bucket_name),
            )
        })
        .await;
        missing_is_done(result)
    }

    /// Starts an ingestion job at most once per `description`.
    ///
    /// The description carries a caller-generated token. Before every retry the
    /// recent jobs are scanned for that token, so a start that reached the
    /// provider but lost its response is adopted instead of duplicated. A
    /// timeout is not retried.
    pub async fn start_ingestion_job(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        description: &str,
    ) -> Result<String, AppError> {
        let mut delays = self.retry.delays();
        loop {
            let attempt = self
                .timeouts
                .run(
                    CallClass::Ingestion,
                    "start_ingestion_job",
                    self.inner
                        .start_ingestion_job(knowledge_base_id, data_source_id, description),
                )
                .await;

            let err = match attempt {
                Ok(job_id) => return Ok(job_id),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            let Some(delay) = delays.next() else {
                return Err(err);
            };
            warn!(
                knowledge_base_id,
                data_source_id,
                error = %err,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "start_ingestion_job failed; retrying"
            );
            tokio::time::sleep(delay).await;

            if let Some(existing) = self
                .find_job_by_description(knowledge_base_id, data_source_id, description)
                .await?
            {
                info!(
                    knowledge_base_id,
                    job_id = %existing.job_id,
                    "earlier attempt already started the ingestion job"
                );
                return Ok(existing.job_id);
            }
        }
    }

    async fn find_job_by_description(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        description: &str,
    ) -> Result<Option<IngestionJobSummary>, AppError> {
        let jobs = self
            .list_ingestion_jobs(knowledge_base_id, data_source_id, 25)
            .await?;
        Ok(jobs
            .into_iter()
            .find(|job| job.description.as_deref() == Some(description)))
    }

    pub async fn get_ingestion_job(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        job_id: &str,
    ) -> Result<IngestionJobSummary, AppError> {
        with_retry(&self.retry, "get_ingestion_job", || {
            self.timeouts.run(
                CallClass::Ingestion,
                "get_ingestion_job",
                self.inner
                    .get_ingestion_job(knowledge_base_id, data_source_id, job_id),
            )
        })
        .await
    }

    pub async fn list_ingestion_jobs(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        max_results: usize,
    ) -> Result<Vec<IngestionJobSummary>, AppError> {
        with_retry(&self.retry, "list_ingestion_jobs", || {
            self.timeouts.run(
                CallClass::Ingestion,
                "list_ingestion_jobs",
                self.inner
                    .list_ingestion_jobs(knowledge_base_id, data_source_id, max_results),
            )
        })
        .await
    }

    pub async fn vector_count(&self, bucket_name: &str, index_name: &str) -> Result<u64, AppError> {
        with_retry(&self.retry, "vector_count", || {
            self.timeouts.run(
                CallClass::Metadata,
                "vector_count",
                self.inner.vector_count(bucket_name, index_name),
            )
        })
        .await
    }
}

impl From<DynIndexProvider> for ProviderClient {
    fn from(inner: DynIndexProvider) -> Self {
        Self::new(inner, TimeoutConfig::default(), RetryPolicy::default())
    }
}

fn accept_existing(result: Result<(), ProviderError>, name: &str) -> Result<(), AppError> {
    match result {
        Ok(()) => Ok(()),
        Err(ProviderError::AlreadyExists(_)) => {
            info!(resource = name, "resource already exists; reusing");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn missing_is_done(result: Result<(), AppError>) -> Result<bool, AppError> {
    match result {
        Ok(()) => Ok(true),
        Err(AppError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::provider::{
        memory::{InMemoryIndexProvider, ProviderCall},
        ChunkingConfig, IndexProvider, ParsingConfig,
    };

    fn fast_client(provider: Arc<InMemoryIndexProvider>) -> ProviderClient {
        ProviderClient::new(
            provider,
            TimeoutConfig::default(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(2),
                max_delay: Duration::from_millis(5),
            },
        )
    }

    async fn seeded(provider: &InMemoryIndexProvider) -> (String, String) {
        let kb = provider
            .create_knowledge_base(&KnowledgeBaseSpec {
                name: "kb".into(),
                description: "kb".into(),
                role_arn: None,
                embedding_model: "embed".into(),
                vector_bucket_arn: "b".into(),
                vector_index_arn: "i".into(),
            })
            .await
            .expect("kb");
        let ds = provider
            .create_data_source(&DataSourceSpec {
                knowledge_base_id: kb.clone(),
                name: "ds".into(),
                description: "ds".into(),
                bucket_arn: "docs".into(),
                inclusion_prefixes: vec!["docs/x/".into()],
                chunking: ChunkingConfig {
                    max_tokens: 500,
                    overlap_percentage: 10,
                },
                parsing: ParsingConfig {
                    model: "m".into(),
                    prompt: "p".into(),
                },
            })
            .await
            .expect("ds");
        (kb, ds)
    }

    #[tokio::test]
    async fn existing_bucket_is_accepted() {
        let provider = Arc::new(InMemoryIndexProvider::new());
        let client = fast_client(Arc::clone(&provider));
        client.ensure_vector_bucket("b").await.expect("first");
        client.ensure_vector_bucket("b").await.expect("second");
    }

    #[tokio::test]
    async fn missing_knowledge_base_is_not_an_error() {
        let provider = Arc::new(InMemoryIndexProvider::new());
        let client = fast_client(Arc::clone(&provider));
        assert!(!client.knowledge_base_exists("KB404").await.expect("lookup"));
        assert!(!client.delete_knowledge_base("KB404").await.expect("delete"));
    }

    #[tokio::test]
    async fn unavailable_provider_does_not_look_like_deletion() {
        let provider = Arc::new(InMemoryIndexProvider::new());
        for _ in 0..3 {
            provider
                .fail_next(
                    ProviderCall::GetKnowledgeBase,
                    ProviderError::Unavailable("503".into()),
                )
                .await;
        }
        let client = fast_client(Arc::clone(&provider));
        assert!(matches!(
            client.knowledge_base_exists("KB1").await,
            Err(AppError::ProviderTransient(_))
        ));
    }

    #[tokio::test]
    async fn transient_start_failure_is_retried_once_started() {
        let provider = Arc::new(InMemoryIndexProvider::new());
        let (kb, ds) = seeded(&provider).await;
        provider
            .fail_next(
                ProviderCall::StartIngestionJob,
                ProviderError::Unavailable("throttled".into()),
            )
            .await;
        let client = fast_client(Arc::clone(&provider));

        let job_id = client
            .start_ingestion_job(&kb, &ds, "sync [token-1]")
            .await
            .expect("job started");

        assert_eq!(provider.jobs().await.len(), 1);
        assert_eq!(provider.jobs().await[0].job_id, job_id);
        assert_eq!(provider.call_count(ProviderCall::StartIngestionJob).await, 2);
    }

    #[tokio::test]
    async fn lost_response_is_adopted_instead_of_starting_twice() {
        let provider = Arc::new(InMemoryIndexProvider::new());
        let (kb, ds) = seeded(&provider).await;
        // The job exists at the provider but the caller saw a transient error.
        let started = provider
            .start_ingestion_job(&kb, &ds, "sync [token-2]")
            .await
            .expect("job");
        provider
            .fail_next(
                ProviderCall::StartIngestionJob,
                ProviderError::Unavailable("connection reset".into()),
            )
            .await;
        let client = fast_client(Arc::clone(&provider));

        let job_id = client
            .start_ingestion_job(&kb, &ds, "sync [token-2]")
            .await
            .expect("adopted");

        assert_eq!(job_id, started);
        assert_eq!(provider.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_start_is_not_retried() {
        let provider = Arc::new(InMemoryIndexProvider::new());
        let (kb, ds) = seeded(&provider).await;
        provider
            .fail_next(
                ProviderCall::StartIngestionJob,
                ProviderError::Rejected("data source busy".into()),
            )
            .await;
        let client = fast_client(Arc::clone(&provider));

        assert!(matches!(
            client.start_ingestion_job(&kb, &ds, "sync [token-3]").await,
            Err(AppError::Provider(_))
        ));
        assert_eq!(provider.call_count(ProviderCall::StartIngestionJob).await, 1);
    }
}
