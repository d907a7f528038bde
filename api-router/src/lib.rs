use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
    Router,
};
use routes::{liveness::live, operations::run_operation, readiness::ready};

pub mod api_state;
pub mod error;
mod routes;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Probes for process supervisors
    let probes = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let operations = Router::new().route(
        "/operations",
        post(run_operation).layer(DefaultBodyLimit::max(app_state.config.max_body_bytes)),
    );

    probes.merge(operations)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header::CONTENT_TYPE, Request, StatusCode},
        Router,
    };
    use common::utils::config::AppConfig;
    use ingestion_orchestrator::testing::TestHarness;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    async fn app() -> Router {
        let harness = TestHarness::new().await.expect("test harness");
        let state = ApiState::new(
            &AppConfig::default(),
            Arc::clone(&harness.db),
            Arc::new(harness.orchestrator.clone()),
        );
        Router::new()
            .nest("/api/v1", api_routes_v1(&state))
            .with_state(state)
    }

    fn post_json(body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/operations")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn probes_answer() {
        let app = app().await;

        let live = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/live")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("live response");
        assert_eq!(live.status(), StatusCode::OK);

        let ready = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/ready")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("ready response");
        assert_eq!(ready.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_or_create_over_http() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(post_json(&json!({
                "operation": "get_or_create",
                "tenant_id": "tenant-http"
            })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let created = json_body(response).await;
        assert_eq!(created["tenant_id"], json!("tenant-http"));

        let response = app
            .oneshot(post_json(&json!({
                "operation": "stats",
                "tenant_id": "tenant-http"
            })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let stats = json_body(response).await;
        assert_eq!(stats["knowledge_base_id"], created["knowledge_base_id"]);
    }

    #[tokio::test]
    async fn caller_mistakes_map_to_client_errors() {
        let app = app().await;

        let missing_tenant = app
            .clone()
            .oneshot(post_json(&json!({ "operation": "list_documents" })))
            .await
            .expect("response");
        assert_eq!(missing_tenant.status(), StatusCode::BAD_REQUEST);

        let unknown_document = app
            .clone()
            .oneshot(post_json(&json!({
                "operation": "get_sync_status",
                "tenant_id": "tenant-http",
                "document_id": "nope"
            })))
            .await
            .expect("response");
        assert_eq!(unknown_document.status(), StatusCode::NOT_FOUND);
        let body = json_body(unknown_document).await;
        assert_eq!(body["status"], json!("error"));

        let malformed = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/operations")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    }
}
