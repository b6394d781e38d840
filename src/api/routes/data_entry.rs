//! `/api/v1/data-entry/*` — the submit-sample REST surface (§6).

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::api::middleware::AuthContext;
use crate::api::state::AppState;
use crate::api::types::{ApiError, BatchItemResponse, SubmitRequest, SubmitResponse};
use crate::engine::SampleResult;
use crate::providers::{SampleContext, SourceKind};

/// Routes that require a valid API key (§6: submit, batch).
pub fn protected_routes() -> Router<AppState> {
    Router::new().route("/submit", post(submit)).route("/batch", post(batch))
}

/// Routes reachable without a key (§6: "`GET .../schema` (no auth)").
pub fn public_routes() -> Router<AppState> {
    Router::new().route("/schema", get(schema))
}

async fn submit_one(state: &AppState, auth: &AuthContext, req: SubmitRequest) -> Result<(SampleResult, DateTime<Utc>), crate::Error> {
    let grant = auth.require()?;
    if !grant.allows(req.characteristic_id) {
        return Err(crate::Error::Forbidden(format!(
            "api key does not grant access to characteristic {}",
            req.characteristic_id
        )));
    }

    let context = SampleContext {
        batch_number: req.batch_number,
        operator_id: req.operator_id,
        source: Some(SourceKind::Rest),
        metadata: req.metadata,
    };

    let event = state.manual.submit(req.characteristic_id, req.measurements, context).await?;
    let timestamp = event.timestamp;
    let result = state
        .engine
        .process_sample(event.characteristic_id, event.measurements, event.timestamp, event.context)
        .await?;
    Ok((result, timestamp))
}

async fn submit(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), crate::Error> {
    let (result, timestamp) = submit_one(&state, &auth, req).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse::from_result(result, timestamp))))
}

/// §6: "same body in an array; independent per-item success/failure" — one
/// item's rejection never prevents the rest from being processed.
async fn batch(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(items): Json<Vec<SubmitRequest>>,
) -> Json<Vec<BatchItemResponse>> {
    let mut responses = Vec::with_capacity(items.len());
    for (index, req) in items.into_iter().enumerate() {
        let response = match submit_one(&state, &auth, req).await {
            Ok((result, timestamp)) => BatchItemResponse {
                index,
                ok: true,
                result: Some(SubmitResponse::from_result(result, timestamp)),
                error: None,
            },
            Err(error) => BatchItemResponse {
                index,
                ok: false,
                result: None,
                error: Some(ApiError::new(error_code_for(&error), error.to_string())),
            },
        };
        responses.push(response);
    }
    Json(responses)
}

fn error_code_for(error: &crate::Error) -> &'static str {
    use crate::api::types::error_codes;
    match error.status_code() {
        400 => error_codes::VALIDATION,
        401 => error_codes::UNAUTHORIZED,
        403 => error_codes::FORBIDDEN,
        404 => error_codes::NOT_FOUND,
        409 => error_codes::CONFLICT,
        _ => error_codes::INTERNAL,
    }
}

/// `GET /api/v1/data-entry/schema` — no auth (§6). Describes the submit
/// request/response shapes for client generation; not a JSON Schema document,
/// since nothing else in this crate's dependency stack produces one.
async fn schema() -> Json<serde_json::Value> {
    Json(json!({
        "submit": {
            "request": {
                "characteristic_id": "integer, required",
                "measurements": "array of float, required",
                "batch_number": "string, optional",
                "operator_id": "string, optional",
                "metadata": "object, optional",
            },
            "response": {
                "sample_id": "integer",
                "timestamp": "RFC 3339 timestamp",
                "mean": "float",
                "range_value": "float or null",
                "zone": "string or null",
                "in_control": "boolean",
                "violations": [{"rule_id": "integer", "rule_name": "string", "severity": "WARNING | CRITICAL"}],
            },
            "errors": {
                "400": "validation",
                "401": "missing or invalid api key",
                "403": "api key does not grant access to this characteristic",
                "500": "process failure",
            },
        },
        "batch": {
            "request": "array of submit requests",
            "response": "array of {index, ok, result?, error?}",
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_served_without_auth() {
        let Json(body) = schema().await;
        assert!(body["submit"]["request"]["characteristic_id"].is_string());
    }
}
