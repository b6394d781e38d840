//! Request-id, rate-limiting, and API-key-authentication middleware (§6, §7).

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::api::state::{AppState, RateLimitResult};
use crate::api::types::{error_codes, ApiError};
use crate::db::models::ApiKeyGrant;

/// Request id extension, propagated into the response's `x-request-id`
/// header for correlating logs with a client-visible identifier.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn client_key(headers: &HeaderMap) -> String {
    if let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return format!("key:{api_key}");
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = forwarded.split(',').next() {
            return format!("ip:{}", ip.trim());
        }
    }
    "ip:unknown".to_string()
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&headers);
    match state.rate_limiter.check_and_increment(&key).await {
        RateLimitResult::Allowed { remaining } => {
            state.metrics.rate_limit_events_total.with_label_values(&["allowed"]).inc();
            let mut response = next.run(request).await;
            if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
                response.headers_mut().insert("x-ratelimit-remaining", value);
            }
            response
        }
        RateLimitResult::Limited { retry_after_secs } => {
            state.metrics.rate_limit_events_total.with_label_values(&["limited"]).inc();
            let body = ApiError::new(
                error_codes::RATE_LIMITED,
                format!("rate limit exceeded, retry after {retry_after_secs}s"),
            );
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
    }
}

/// The grant behind the `x-api-key` header on this request, if one was
/// presented and found valid. Inserted into request extensions by
/// [`auth_middleware`]; data-entry handlers read it to check 403
/// "key-lacks-characteristic" (§7).
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub grant: Option<ApiKeyGrant>,
}

impl AuthContext {
    /// Returns the grant or a 401, matching §7 "401 auth".
    pub fn require(&self) -> Result<&ApiKeyGrant, crate::Error> {
        self.grant
            .as_ref()
            .ok_or_else(|| crate::Error::Unauthorized("missing or invalid api key".to_string()))
    }
}

pub async fn auth_middleware(State(state): State<AppState>, headers: HeaderMap, mut request: Request, next: Next) -> Response {
    let grant = match headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        Some(raw_key) => state.auth.verify(raw_key).await,
        None => None,
    };
    let result = if grant.is_some() { "valid" } else { "invalid" };
    state.metrics.api_key_verifications_total.with_label_values(&[result]).inc();
    request.extensions_mut().insert(AuthContext { grant });
    next.run(request).await
}
