//! Public front door: forward an HTTP request through an agent's session.

use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::addressing::{self, AddressingError, RELAY_HEADERS};
use super::request::request_id;
use super::server::AppState;
use crate::observability::metrics;
use crate::protocol::{Headers, HttpRequestContent, HttpResponseContent};
use crate::rpc::{self, RpcError};

/// Connection-level headers that never cross the tunnel.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("authorization required")]
    Unauthorized,
    #[error("tunnel offline")]
    TunnelOffline,
    #[error("agent did not respond in time")]
    Timeout,
    #[error("malformed response from agent: {0}")]
    BadGateway(String),
    #[error("relay is at capacity")]
    Exhausted,
    #[error("request body too large or unreadable")]
    PayloadTooLarge,
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::Unauthorized => StatusCode::UNAUTHORIZED,
            ForwardError::TunnelOffline => StatusCode::NOT_FOUND,
            ForwardError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ForwardError::Exhausted => StatusCode::SERVICE_UNAVAILABLE,
            ForwardError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Label for metrics and the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::Unauthorized => "unauthorized",
            ForwardError::TunnelOffline => "tunnel_offline",
            ForwardError::Timeout => "timeout",
            ForwardError::BadGateway(_) => "bad_gateway",
            ForwardError::Exhausted => "exhausted",
            ForwardError::PayloadTooLarge => "payload_too_large",
        }
    }
}

impl From<AddressingError> for ForwardError {
    fn from(err: AddressingError) -> Self {
        match err {
            AddressingError::Missing | AddressingError::Denied => ForwardError::Unauthorized,
            AddressingError::Offline(_) => ForwardError::TunnelOffline,
        }
    }
}

impl From<RpcError> for ForwardError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout(_) => ForwardError::Timeout,
            RpcError::ConnectionClosed => ForwardError::TunnelOffline,
            RpcError::Malformed(detail) => ForwardError::BadGateway(detail),
            RpcError::Transport(detail) => ForwardError::BadGateway(detail),
            RpcError::Exhausted { .. } => ForwardError::Exhausted,
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"relay\""));
        }
        response
    }
}

/// Handler for every public route.
pub async fn forward(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let request_id = request_id(request.headers()).to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match forward_request(&state, request).await {
        Ok(response) => {
            let status = response.status();
            tracing::debug!(request_id = %request_id, method = %method, path = %path, status = status.as_u16(), "Forwarded request");
            metrics::record_forward("ok", status.as_u16(), start);
            response
        }
        Err(e) => {
            tracing::debug!(request_id = %request_id, method = %method, path = %path, error = %e, "Forward failed");
            metrics::record_forward(e.code(), e.status().as_u16(), start);
            e.into_response()
        }
    }
}

async fn forward_request(state: &AppState, request: Request<Body>) -> Result<Response, ForwardError> {
    let addressing = addressing::parse(request.headers())?;
    let session = addressing::resolve(&state.registry, &addressing).await?;

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|_| ForwardError::PayloadTooLarge)?;

    let mut headers = Headers::from_header_map(&parts.headers);
    strip_transport_headers(&mut headers);
    for name in RELAY_HEADERS {
        headers.remove(name);
    }
    if addressing.consumes_authorization() {
        headers.remove(header::AUTHORIZATION.as_str());
    }

    let uri = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
    let content = HttpRequestContent {
        method: parts.method.as_str().to_string(),
        uri,
        headers,
        body: body.to_vec(),
    };

    let response = rpc::call(&session, content, state.rpc_timeout).await?;
    into_http_response(response)
}

fn strip_transport_headers(headers: &mut Headers) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    // Recomputed from the body on each side of the tunnel.
    headers.remove(header::CONTENT_LENGTH.as_str());
}

fn into_http_response(content: HttpResponseContent) -> Result<Response, ForwardError> {
    let status = StatusCode::from_u16(content.status_code())
        .map_err(|_| ForwardError::BadGateway(format!("invalid status code {}", content.status_code())))?;

    let mut headers = content.headers;
    strip_transport_headers(&mut headers);

    let mut response = Response::new(Body::from(content.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers.to_header_map();
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_status_codes() {
        let cases = [
            (ForwardError::from(RpcError::Timeout(std::time::Duration::from_secs(1))), 504),
            (ForwardError::from(RpcError::ConnectionClosed), 404),
            (ForwardError::from(RpcError::Malformed("x".into())), 502),
            (ForwardError::from(RpcError::Exhausted { limit: 1 }), 503),
            (ForwardError::from(AddressingError::Denied), 401),
            (ForwardError::from(AddressingError::Missing), 401),
        ];
        for (error, status) in cases {
            assert_eq!(error.status().as_u16(), status, "{error}");
        }
    }

    #[test]
    fn unauthorized_response_challenges_for_basic() {
        let response = ForwardError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[test]
    fn response_content_keeps_binary_body_and_headers() {
        let content = HttpResponseContent::new(201)
            .with_header("X-Hub", "1")
            .with_header("Transfer-Encoding", "chunked")
            .with_body(vec![0u8, 159, 146, 150]);
        let response = into_http_response(content).unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-hub"], "1");
        assert!(!response.headers().contains_key("transfer-encoding"));
    }

    #[test]
    fn unset_status_defaults_to_ok() {
        let response = into_http_response(HttpResponseContent::default()).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn invalid_status_is_bad_gateway() {
        let err = into_http_response(HttpResponseContent::new(42)).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
