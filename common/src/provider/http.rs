use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use super::{
    DataSourceInfo, DataSourceSpec, IndexProvider, IngestionJobSummary, KnowledgeBaseInfo,
    KnowledgeBaseSpec, ProviderError, ProviderResult, Readiness, VectorIndexSpec,
};

/// REST client for a managed vector-index service.
///
/// Status mapping: 404 -> `NotFound`, 409 -> `AlreadyExists`, 408/429/5xx and
/// transport failures -> `Unavailable`, any other non-success -> `Rejected`.
#[derive(Clone)]
pub struct HttpIndexProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedKnowledgeBase {
    knowledge_base_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedDataSource {
    data_source_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartedJob {
    ingestion_job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobList {
    #[serde(default)]
    ingestion_job_summaries: Vec<IngestionJobSummary>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VectorIndexState {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    vector_count: Option<u64>,
}

#[derive(Serialize)]
struct StartJobRequest<'a> {
    description: &'a str,
}

impl HttpIndexProvider {
    pub fn new(base_url: &str, api_key: Option<String>) -> ProviderResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Rejected(format!("http client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, resource: &str) -> ProviderResult<Response> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(%status, resource, body = %body, "provider call rejected");
        Err(classify(status, resource, &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        resource: &str,
    ) -> ProviderResult<T> {
        self.send(builder, resource)
            .await?
            .json::<T>()
            .await
            .map_err(|err| ProviderError::Rejected(format!("{resource}: malformed response: {err}")))
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    ProviderError::Unavailable(err.to_string())
}

fn classify(status: StatusCode, resource: &str, body: &str) -> ProviderError {
    let detail = if body.is_empty() {
        format!("{resource} ({status})")
    } else {
        format!("{resource} ({status}): {body}")
    };

    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(detail),
        StatusCode::CONFLICT => ProviderError::AlreadyExists(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::Unavailable(detail)
        }
        s if s.is_server_error() => ProviderError::Unavailable(detail),
        _ => ProviderError::Rejected(detail),
    }
}

#[async_trait]
impl IndexProvider for HttpIndexProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_vector_bucket(&self, bucket_name: &str) -> ProviderResult<()> {
        let builder = self.request(Method::PUT, &format!("vector-buckets/{bucket_name}"));
        self.send(builder, bucket_name).await.map(|_| ())
    }

    async fn create_vector_index(&self, spec: &VectorIndexSpec) -> ProviderResult<()> {
        let builder = self
            .request(
                Method::PUT,
                &format!(
                    "vector-buckets/{}/indexes/{}",
                    spec.bucket_name, spec.index_name
                ),
            )
            .json(spec);
        self.send(builder, &spec.index_name).await.map(|_| ())
    }

    async fn vector_index_readiness(
        &self,
        bucket_name: &str,
        index_name: &str,
    ) -> ProviderResult<Readiness> {
        let builder = self.request(
            Method::GET,
            &format!("vector-buckets/{bucket_name}/indexes/{index_name}"),
        );
        let state: VectorIndexState = self.send_json(builder, index_name).await?;
        Ok(match state.status.as_deref() {
            None => Readiness::NoSignal,
            Some(status) if status.eq_ignore_ascii_case("active") => Readiness::Ready,
            Some(_) => Readiness::NotReady,
        })
    }

    async fn create_knowledge_base(&self, spec: &KnowledgeBaseSpec) -> ProviderResult<String> {
        let builder = self.request(Method::POST, "knowledge-bases").json(spec);
        let created: CreatedKnowledgeBase = self.send_json(builder, &spec.name).await?;
        Ok(created.knowledge_base_id)
    }

    async fn create_data_source(&self, spec: &DataSourceSpec) -> ProviderResult<String> {
        let builder = self
            .request(
                Method::POST,
                &format!("knowledge-bases/{}/data-sources", spec.knowledge_base_id),
            )
            .json(spec);
        let created: CreatedDataSource = self.send_json(builder, &spec.name).await?;
        Ok(created.data_source_id)
    }

    async fn get_knowledge_base(
        &self,
        knowledge_base_id: &str,
    ) -> ProviderResult<KnowledgeBaseInfo> {
        let builder = self.request(Method::GET, &format!("knowledge-bases/{knowledge_base_id}"));
        self.send_json(builder, knowledge_base_id).await
    }

    async fn get_data_source(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
    ) -> ProviderResult<DataSourceInfo> {
        let builder = self.request(
            Method::GET,
            &format!("knowledge-bases/{knowledge_base_id}/data-sources/{data_source_id}"),
        );
        self.send_json(builder, data_source_id).await
    }

    async fn delete_knowledge_base(&self, knowledge_base_id: &str) -> ProviderResult<()> {
        let builder =
            self.request(Method::DELETE, &format!("knowledge-bases/{knowledge_base_id}"));
        self.send(builder, knowledge_base_id).await.map(|_| ())
    }

    async fn delete_vector_bucket(&self, bucket_name: &str) -> ProviderResult<()> {
        let builder = self.request(Method::DELETE, &format!("vector-buckets/{bucket_name}"));
        self.send(builder, bucket_name).await.map(|_| ())
    }

    async fn start_ingestion_job(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        description: &str,
    ) -> ProviderResult<String> {
        let builder = self
            .request(
                Method::POST,
                &format!(
                    "knowledge-bases/{knowledge_base_id}/data-sources/{data_source_id}/ingestion-jobs"
                ),
            )
            .json(&StartJobRequest { description });
        let started: StartedJob = self.send_json(builder, data_source_id).await?;
        Ok(started.ingestion_job_id)
    }

    async fn get_ingestion_job(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        job_id: &str,
    ) -> ProviderResult<IngestionJobSummary> {
        let builder = self.request(
            Method::GET,
            &format!(
                "knowledge-bases/{knowledge_base_id}/data-sources/{data_source_id}/ingestion-jobs/{job_id}"
            ),
        );
        self.send_json(builder, job_id).await
    }

    async fn list_ingestion_jobs(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
        max_results: usize,
    ) -> ProviderResult<Vec<IngestionJobSummary>> {
        let builder = self
            .request(
                Method::GET,
                &format!(
                    "knowledge-bases/{knowledge_base_id}/data-sources/{data_source_id}/ingestion-jobs"
                ),
            )
            .query(&[
                ("maxResults", max_results.to_string()),
                ("sortBy", "STARTED_AT".to_string()),
                ("sortOrder", "DESCENDING".to_string()),
            ]);
        let listed: JobList = self.send_json(builder, data_source_id).await?;
        Ok(listed.ingestion_job_summaries)
    }

    async fn vector_count(&self, bucket_name: &str, index_name: &str) -> ProviderResult<u64> {
        let builder = self.request(
            Method::GET,
            &format!("vector-buckets/{bucket_name}/indexes/{index_name}"),
        );
        let state: VectorIndexState = self.send_json(builder, index_name).await?;
        Ok(state.vector_count.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, "kb-1", ""),
            ProviderError::NotFound(_)
        ));
        assert!(matches!(
            classify(StatusCode::CONFLICT, "bucket", "exists"),
            ProviderError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, "job", ""),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, "job", ""),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "kb", "invalid name"),
            ProviderError::Rejected(_)
        ));
    }

    #[test]
    fn job_summaries_decode_from_wire_format() {
        let raw = r#"{
            "ingestionJobSummaries": [
                {"jobId": "JOB1", "status": "COMPLETE", "description": "batch"},
                {"jobId": "JOB0", "status": "FAILED", "failureReasons": ["parse error"]}
            ]
        }"#;
        let listed: JobList = serde_json::from_str(raw).expect("decode");
        assert_eq!(listed.ingestion_job_summaries.len(), 2);
        assert_eq!(
            listed.ingestion_job_summaries[1].failure_reasons,
            vec!["parse error".to_string()]
        );
    }

    #[test]
    fn base_url_is_normalised() {
        let provider =
            HttpIndexProvider::new("http://localhost:4566/", None).expect("client builds");
        assert_eq!(provider.base_url, "http://localhost:4566");
    }
}
