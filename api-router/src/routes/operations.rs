use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use ingestion_orchestrator::OperationRequest;
use serde_json::Value;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

/// Runs one orchestrator operation. The body is the operation request itself:
/// `{ "operation": ..., "tenant_id": ..., ...payload }`.
pub async fn run_operation(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(raw) = body.map_err(|rejection| ApiError::from_rejection(&rejection))?;
    let request: OperationRequest = serde_json::from_value(raw)
        .map_err(|err| ApiError::ValidationError(format!("invalid request: {err}")))?;

    let operation = request.operation.name();
    info!(
        operation,
        tenant_id = request.tenant_id.as_deref().unwrap_or(""),
        "Received operation request"
    );

    let body = state.orchestrator.execute(request).await?;
    Ok((StatusCode::OK, Json(body)))
}
