//! Local HTTP handling on the agent side.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;

use crate::protocol::{Headers, HttpRequestContent, HttpResponseContent};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid base url: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error("invalid forwarded request: {0}")]
    InvalidRequest(String),
    #[error("local request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

/// Turns a forwarded request into the hub's response.
#[async_trait]
pub trait LocalHttpHandler: Send + Sync + 'static {
    async fn handle(&self, request: HttpRequestContent) -> Result<HttpResponseContent, HandlerError>;
}

/// Replays forwarded requests against a local HTTP server.
#[derive(Debug, Clone)]
pub struct ReqwestHandler {
    client: reqwest::Client,
    base_url: url::Url,
}

impl ReqwestHandler {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HandlerError> {
        let base_url = url::Url::parse(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, base_url })
    }

    fn target(&self, uri: &str) -> Result<url::Url, HandlerError> {
        if !uri.starts_with('/') {
            return Err(HandlerError::InvalidRequest(format!("uri '{uri}' is not origin-form")));
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        url::Url::parse(&format!("{base}{uri}")).map_err(|e| HandlerError::InvalidRequest(e.to_string()))
    }
}

#[async_trait]
impl LocalHttpHandler for ReqwestHandler {
    async fn handle(&self, request: HttpRequestContent) -> Result<HttpResponseContent, HandlerError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HandlerError::InvalidRequest(format!("bad method '{}'", request.method)))?;
        let url = self.target(&request.uri)?;

        let mut headers = request.headers.to_header_map();
        headers.remove(header::HOST);

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = Headers::from_header_map(response.headers());
        let body = response.bytes().await?;
        Ok(HttpResponseContent {
            status: Some(status),
            headers,
            body: body.to_vec(),
        })
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HttpRequestContent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponseContent, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> LocalHttpHandler for FnHandler<F>
where
    F: Fn(HttpRequestContent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponseContent, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: HttpRequestContent) -> Result<HttpResponseContent, HandlerError> {
        (self.0)(request).await
    }
}
