//! API request/response JSON shapes and the error-response mapping (§6, §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::rules::Severity;

/// Standard error body, matching the `{code, message}` shape the teacher's
/// registry API uses.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Error codes surfaced in [`ApiError::code`].
pub mod error_codes {
    pub const VALIDATION: &str = "VALIDATION";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const INTERNAL: &str = "INTERNAL";
}

fn code_for(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => error_codes::VALIDATION,
        StatusCode::UNAUTHORIZED => error_codes::UNAUTHORIZED,
        StatusCode::FORBIDDEN => error_codes::FORBIDDEN,
        StatusCode::NOT_FOUND => error_codes::NOT_FOUND,
        StatusCode::CONFLICT => error_codes::CONFLICT,
        _ => error_codes::INTERNAL,
    }
}

/// Maps the crate's unified error taxonomy (§7) onto the REST error body,
/// so handlers can propagate with `?` instead of matching on `crate::Error`
/// at every call site.
impl IntoResponse for crate::Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request_failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request_rejected");
        }
        (status, Json(ApiError::new(code_for(status), self.to_string()))).into_response()
    }
}

// ============================================================================
// data-entry request/response types
// ============================================================================

/// Body of `POST /api/v1/data-entry/submit` (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub characteristic_id: i64,
    pub measurements: Vec<f64>,
    #[serde(default)]
    pub batch_number: Option<String>,
    #[serde(default)]
    pub operator_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// A reported violation, embedded in [`SubmitResponse`] (§6).
#[derive(Debug, Clone, Serialize)]
pub struct ViolationSummary {
    pub rule_id: u8,
    pub rule_name: &'static str,
    pub severity: Severity,
}

/// Response body of a successful submission (§6).
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub sample_id: i64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub mean: f64,
    pub range_value: Option<f64>,
    pub zone: Option<crate::stats::Zone>,
    pub in_control: bool,
    pub violations: Vec<ViolationSummary>,
}

impl SubmitResponse {
    pub fn from_result(result: crate::engine::SampleResult, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        SubmitResponse {
            sample_id: result.sample_id,
            timestamp,
            mean: result.mean,
            range_value: result.range_value,
            zone: result.zone,
            in_control: result.in_control,
            violations: result
                .violations
                .into_iter()
                .map(|v| ViolationSummary {
                    rule_id: v.rule_id,
                    rule_name: v.rule_name,
                    severity: v.severity,
                })
                .collect(),
        }
    }
}

/// One element of the `POST /api/v1/data-entry/batch` response (§6:
/// "independent per-item success/failure").
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResponse {
    pub index: usize,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SubmitResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_maps_to_400() {
        let err = crate::Error::Validation("bad input".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn forbidden_error_maps_to_403() {
        let err = crate::Error::Forbidden("key lacks characteristic".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
