use axum::extract::{OriginalUri, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::coordinator::RenderedResponse;

use super::state::HttpState;

/// Reports the State Reporter's current coarse state plus pool occupancy,
/// for uptime monitors — not part of the render pipeline itself.
pub async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    let pool_total = state.coordinator.pool_size().await;
    let pool_busy = pool_total.saturating_sub(state.coordinator.pool_idle_count());
    let reported = state.coordinator.current_state();

    Json(json!({
        "state": reported,
        "workers": { "busy": pool_busy, "total": pool_total },
    }))
}

/// Single catch-all render handler: every GET that isn't `/health` flows
/// through the Request Coordinator and its cache/worker-pool pipeline.
pub async fn render(
    State(state): State<HttpState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    let raw = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());

    // A malformed date parses to absent, per the conditional-request
    // contract — it is simply not used to revalidate, not a request error.
    let if_modified_since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .map(chrono::DateTime::<chrono::Utc>::from);

    match state.coordinator.handle(raw, if_none_match, if_modified_since).await {
        RenderedResponse::Ok { body, etag, last_modified, expires_at_ms } => {
            let mut response_headers = HeaderMap::new();
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            );
            if let Ok(value) = HeaderValue::from_str(&etag) {
                response_headers.insert(header::ETAG, value);
            }
            if let Some(last_modified) = last_modified {
                if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(last_modified.into())) {
                    response_headers.insert(header::LAST_MODIFIED, value);
                }
            }
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let max_age = expires_at_ms.saturating_sub(now_ms) / 1000;
            if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={max_age}")) {
                response_headers.insert(header::CACHE_CONTROL, value);
            }
            (StatusCode::OK, response_headers, body).into_response()
        }
        RenderedResponse::NotModified { etag } => {
            let mut response_headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&etag) {
                response_headers.insert(header::ETAG, value);
            }
            (StatusCode::NOT_MODIFIED, response_headers).into_response()
        }
        RenderedResponse::NotFound => StatusCode::NOT_FOUND.into_response(),
        RenderedResponse::NotImplemented => StatusCode::NOT_IMPLEMENTED.into_response(),
        RenderedResponse::ServerError(reason) => (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response(),
        RenderedResponse::ServiceUnavailable(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason).into_response(),
    }
}
