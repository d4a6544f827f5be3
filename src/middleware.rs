use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::info;

use crate::manager::RateLimitManager;

/// Identifier used when a request carries neither an API key nor a forwarded address
pub const ANONYMOUS_IDENTIFIER: &str = "anonymous";

/// Derive the rate limit identifier for a request.
///
/// Precedence: `x-api-key`, then the first `x-forwarded-for` entry, then
/// [`ANONYMOUS_IDENTIFIER`].
pub fn extract_identifier(headers: &HeaderMap) -> String {
    if let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let api_key = api_key.trim();
        if !api_key.is_empty() {
            return api_key.to_string();
        }
    }

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first_ip) = forwarded.split(',').next().map(str::trim) {
            if !first_ip.is_empty() {
                return first_ip.to_string();
            }
        }
    }

    ANONYMOUS_IDENTIFIER.to_string()
}

/// Response sent when a request is rejected
pub fn rate_limited_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "Rate limit exceeded" })),
    )
        .into_response()
}

/// Admission control for an axum router.
///
/// Install with `axum::middleware::from_fn_with_state(manager, admission_middleware)`.
pub async fn admission_middleware(
    State(manager): State<RateLimitManager>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = extract_identifier(request.headers());
    let limited = manager.is_rate_limited(&identifier).await;
    manager.spawn_save_state(identifier.clone());

    if limited {
        info!(
            target: "rust_admission::middleware",
            identifier = %identifier,
            method = %request.method(),
            uri = %request.uri(),
            "Request rejected"
        );
        return rate_limited_response();
    }

    next.run(request).await
}
