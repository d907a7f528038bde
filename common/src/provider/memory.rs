use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    DataSourceInfo, DataSourceSpec, IndexProvider, IngestionJobStatus, IngestionJobSummary,
    KnowledgeBaseInfo, KnowledgeBaseSpec, ProviderError, ProviderResult, Readiness,
    VectorIndexSpec,
};

/// Provider calls that can be observed or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderCall {
    CreateVectorBucket,
    CreateVectorIndex,
    VectorIndexReadiness,
    CreateKnowledgeBase,
    CreateDataSource,
    GetKnowledgeBase,
    GetDataSource,
    DeleteKnowledgeBase,
    DeleteVectorBucket,
    StartIngestionJob,
    GetIngestionJob,
    ListIngestionJobs,
    VectorCount,
}

struct KnowledgeBaseRecord {
    spec: KnowledgeBaseSpec,
    data_sources: HashMap<String, DataSourceSpec>,
}

struct JobRecord {
    knowledge_base_id: String,
    data_source_id: String,
    summary: IngestionJobSummary,
}

#[derive(Default)]
struct ProviderState {
    buckets: HashSet<String>,
    indexes: HashMap<(String, String), VectorIndexSpec>,
    knowledge_bases: HashMap<String, KnowledgeBaseRecord>,
    jobs: Vec<JobRecord>,
    vector_counts: HashMap<(String, String), u64>,
    next_id: u64,
    scripted_failures: HashMap<ProviderCall, VecDeque<ProviderError>>,
    calls: Vec<ProviderCall>,
}

impl ProviderState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id = self.next_id.saturating_add(1);
        format!("{prefix}{:08}", self.next_id)
    }

    fn enter(&mut self, call: ProviderCall) -> ProviderResult<()> {
        self.calls.push(call);
        match self
            .scripted_failures
            .get_mut(&call)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn data_source(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
    ) -> ProviderResult<&DataSourceSpec> {
        self.knowledge_bases
            .get(knowledge_base_id)
            .ok_or_else(|| ProviderError::NotFound(knowledge_base_id.to_string()))?
            .data_sources
            .get(data_source_id)
            .ok_or_else(|| ProviderError::NotFound(data_source_id.to_string()))
    }
}

/// In-process provider used by local runs and tests. Jobs stay in `STARTING`
/// until [`InMemoryIndexProvider::set_job_status`] moves them.
pub struct InMemoryIndexProvider {
    state: Mutex<ProviderState>,
    readiness: Readiness,
}

impl Default for InMemoryIndexProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIndexProvider {
    pub fn new() -> Self {
        Self::with_readiness(Readiness::Ready)
    }

    pub fn with_readiness(readiness: Readiness) -> Self {
        Self {
            state: Mutex::new(ProviderState::default()),
            readiness,
        }
    }

    /// Queue an error returned by the next invocation of `call`.
    pub async fn fail_next(&self, call: ProviderCall, err: ProviderError) {
        self.state
            .lock()
            .await
            .scripted_failures
            .entry(call)
            .or_default()
            .push_back(err);
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, call: ProviderCall) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|seen| **seen == call)
            .count()
    }

    pub async fn set_job_status(
        &self,
        job_id: &str,
        status: IngestionJobStatus,
        failure_reasons: Vec<String>,
    ) -> bool {
        let mut state = self.state.lock().await;
        match state
            .jobs
            .iter_mut()
            .find(|job| job.summary.job_id == job_id)
        {
            Some(job) => {
                job.summary.status = status;
                job.summary.failure_reasons = failure_reasons;
                true
            }
            None => false,
        }
    }

    pub async fn set_vector_count(&self, bucket_name: &str, index_name: &str, count: u64) {
        self.state
            .lock()
            .await
            .vector_counts
            .insert((bucket_name.to_string(), index_name.to_string()), count);
    }

    /// Drop a knowledge base without going through the API, as an operator would.
    pub async fn remove_knowledge_base(&self, knowledge_base_id: &str) -> bool {
        self.state
            .lock()
            .await
            .knowledge_bases
            .remove(knowledge_base_id)
            .is_some()
    }

    pub async fn knowledge_base_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .await
            .knowledge_bases
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub async fn bucket_exists(&self, bucket_name: &str) -> bool {
        self.state.lock().await.buckets.contains(bucket_name)
    }

    pub async fn vector_index(&self, bucket_name: &str, index_name: &str) -> Option<VectorIndexSpec> {
        self.state
            .lock()
            .await
            .indexes
            .get(&(bucket_name.to_string(), index_name.to_string()))
            .cloned()
    }

    pub async fn knowledge_base_spec(&self, knowledge_base_id: &str) -> Option<KnowledgeBaseSpec> {
        self.state
            .lock()
            .await
            .knowledge_bases
            .get(knowledge_base_id)
            .map(|record| record.spec.clone())
    }

    pub async fn data_sources(&self, knowledge_base_id: &str) -> Vec<DataSourceSpec> {
        self.state
            .lock()
            .await
            .knowledge_bases
            .get(knowledge_base_id)
            .map(|record| record.data_sources.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn jobs(&self) -> Vec<IngestionJobSummary> {
        self.state
            .lock()
            .await
            .jobs
            .iter()
            .map(|job| job.summary.clone())
            .collect()
    }
}

#[async_trait]
impl IndexProvider for InMemoryIndexProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_vector_bucket(&self, bucket_name: &str) -> ProviderResult<()> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::CreateVectorBucket)?;
        if !state.buckets.insert(bucket_name.to_string()) {
            return Err(ProviderError::AlreadyExists(bucket_name.to_string()));
        }
        Ok(())
    }

    async fn create_vector_index(&self, spec: &VectorIndexSpec) -> ProviderResult<()> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::CreateVectorIndex)?;
        if !state.buckets.contains(&spec.bucket_name) {
            return Err(ProviderError::NotFound(spec.bucket_name.clone()));
        }
        let key = (spec.bucket_name.clone(), spec.index_name.clone());
        if state.indexes.contains_key(&key) {
            return Err(ProviderError::AlreadyExists(spec.index_name.clone()));
        }
        state.indexes.insert(key, spec.clone());
        Ok(())
    }

    async fn vector_index_readiness(
        &self,
        bucket_name: &str,
        index_name: &str,
    ) -> ProviderResult<Readiness> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::VectorIndexReadiness)?;
        if !state
            .indexes
            .contains_key(&(bucket_name.to_string(), index_name.to_string()))
        {
            return Err(ProviderError::NotFound(index_name.to_string()));
        }
        Ok(self.readiness)
    }

    async fn create_knowledge_base(&self, spec: &KnowledgeBaseSpec) -> ProviderResult<String> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::CreateKnowledgeBase)?;
        if state
            .knowledge_bases
            .values()
            .any(|record| record.spec.name == spec.name)
        {
            return Err(ProviderError::AlreadyExists(spec.name.clone()));
        }
        let id = state.next_id("KB");
        state.knowledge_bases.insert(
            id.clone(),
            KnowledgeBaseRecord {
                spec: spec.clone(),
                data_sources: HashMap::new(),
            },
        );
        Ok(id)
    }

    async fn create_data_source(&self, spec: &DataSourceSpec) -> ProviderResult<String> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::CreateDataSource)?;
        let id = state.next_id("DS");
        let record = state
            .knowledge_bases
            .get_mut(&spec.knowledge_base_id)
            .ok_or_else(|| ProviderError::NotFound(spec.knowledge_base_id.clone()))?;
        record.data_sources.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn get_knowledge_base(
        &self,
        knowledge_base_id: &str,
    ) -> ProviderResult<KnowledgeBaseInfo> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::GetKnowledgeBase)?;
        state
            .knowledge_bases
            .get(knowledge_base_id)
            .map(|record| KnowledgeBaseInfo {
                id: knowledge_base_id.to_string(),
                name: record.spec.name.clone(),
                status: "ACTIVE".to_string(),
            })
            .ok_or_else(|| ProviderError::NotFound(knowledge_base_id.to_string()))
    }

    async fn get_data_source(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
    ) -> ProviderResult<DataSourceInfo> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::GetDataSource)?;
        state
            .data_source(knowledge_base_id, data_source_id)
            .map(|_| DataSourceInfo {
                id: data_source_id.to_string(),
                status: "AVAILABLE".to_string(),
            })
    }

    async fn delete_knowledge_base(&self, knowledge_base_id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::DeleteKnowledgeBase)?;
        state
            .knowledge_bases
            .remove(knowledge_base_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(knowledge_base_id.to_string()))
    }

    async fn delete_vector_bucket(&self, bucket_name: &str) -> ProviderResult<()> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::DeleteVectorBucket)?;
        if !state.buckets.remove(bucket_name) {
            return Err(ProviderError::NotFound(bucket_name.to_string()));
        }
        state.indexes.retain(|(bucket, _), _| bucket != bucket_name);
        Ok(())
    }

    async fn start_ingestion_job(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        description: &str,
    ) -> ProviderResult<String> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::StartIngestionJob)?;
        state.data_source(knowledge_base_id, data_source_id)?;
        let job_id = state.next_id("JOB");
        state.jobs.push(JobRecord {
            knowledge_base_id: knowledge_base_id.to_string(),
            data_source_id: data_source_id.to_string(),
            summary: IngestionJobSummary {
                job_id: job_id.clone(),
                status: IngestionJobStatus::Starting,
                description: Some(description.to_string()),
                failure_reasons: Vec::new(),
                started_at: Some(Utc::now()),
            },
        });
        Ok(job_id)
    }

    async fn get_ingestion_job(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        job_id: &str,
    ) -> ProviderResult<IngestionJobSummary> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::GetIngestionJob)?;
        state
            .jobs
            .iter()
            .find(|job| {
                job.summary.job_id == job_id
                    && job.knowledge_base_id == knowledge_base_id
                    && job.data_source_id == data_source_id
            })
            .map(|job| job.summary.clone())
            .ok_or_else(|| ProviderError::NotFound(job_id.to_string()))
    }

    async fn list_ingestion_jobs(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        max_results: usize,
    ) -> ProviderResult<Vec<IngestionJobSummary>> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::ListIngestionJobs)?;
        state.data_source(knowledge_base_id, data_source_id)?;
        Ok(state
            .jobs
            .iter()
            .rev()
            .filter(|job| {
                job.knowledge_base_id == knowledge_base_id && job.data_source_id == data_source_id
            })
            .take(max_results)
            .map(|job| job.summary.clone())
            .collect())
    }

    async fn vector_count(&self, bucket_name: &str, index_name: &str) -> ProviderResult<u64> {
        let mut state = self.state.lock().await;
        state.enter(ProviderCall::VectorCount)?;
        let key = (bucket_name.to_string(), index_name.to_string());
        if !state.indexes.contains_key(&key) {
            return Err(ProviderError::NotFound(index_name.to_string()));
        }
        Ok(state.vector_counts.get(&key).copied().unwrap_or(0))
    }
}
