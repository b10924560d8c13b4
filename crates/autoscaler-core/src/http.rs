//! Shared HTTP/1 client for outbound calls.
//!
//! Every exchange (connect, send, read body) runs under a single timeout
//! so a wedged backend cannot stall a worker indefinitely. Response bodies
//! are capped at [`MAX_BODY_BYTES`].

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

/// Largest response body we are willing to buffer.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const USER_AGENT: &str = "autoscaler/0.1";

/// Errors raised while performing an HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid request: {0}")]
    Request(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Status and fully buffered body of a response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        let inner = Client::builder(TokioExecutor::new()).build_http();
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn get(&self, uri: &str) -> Result<HttpResponse, HttpError> {
        self.send(Method::GET, uri, None).await
    }

    pub async fn post_json(&self, uri: &str, body: Vec<u8>) -> Result<HttpResponse, HttpError> {
        self.send(Method::POST, uri, Some(body)).await
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, HttpError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("user-agent", USER_AGENT);
        let body = match body {
            Some(bytes) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(bytes))
            }
            None => Full::new(Bytes::new()),
        };
        let req = builder
            .body(body)
            .map_err(|e| HttpError::Request(e.to_string()))?;

        let exchange = async {
            let resp = self
                .inner
                .request(req)
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;
            let status = resp.status();
            let body = Limited::new(resp.into_body(), MAX_BODY_BYTES)
                .collect()
                .await
                .map_err(|e| HttpError::Body(e.to_string()))?
                .to_bytes();
            Ok(HttpResponse { status, body })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(HttpError::Timeout(self.timeout)),
        }
    }
}
