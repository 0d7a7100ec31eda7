//! Request id helpers.
//!
//! Ids are assigned by `SetRequestIdLayer` before any handler runs and echoed
//! back by `PropagateRequestIdLayer`; forwarded requests carry the same
//! header so agent logs can be joined with relay logs.

use axum::http::HeaderMap;

pub const X_REQUEST_ID: &str = "x-request-id";

/// The request id assigned by the middleware stack.
pub fn request_id(headers: &HeaderMap) -> &str {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}
