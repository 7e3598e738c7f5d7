//! Trace ids for tapped requests
//!
//! An inbound W3C `traceparent` header is reused verbatim so events line up
//! with the caller's own tracing; otherwise a traceparent-shaped id is minted.

use axum::http::HeaderMap;

const TRACEPARENT: &str = "traceparent";

/// Trace id from `traceparent`, or a freshly generated one
pub fn trace_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(TRACEPARENT)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .unwrap_or_else(generate_trace_id)
}

/// `00-<32 hex trace id>-<16 hex span id>-01`
pub fn generate_trace_id() -> String {
    let trace = uuid::Uuid::new_v4().simple().to_string();
    let span = uuid::Uuid::new_v4().simple().to_string();
    format!("00-{}-{}-01", trace, &span[..16])
}
