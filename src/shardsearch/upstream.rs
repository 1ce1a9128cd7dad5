use std::future::Future;
use std::time::Duration;

use hyper::Method;
use reqwest::header::CONTENT_TYPE;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

/// Header carrying the engine credential.
pub const API_KEY_HEADER: &str = "X-TYPESENSE-API-KEY";
/// Query parameter carrying the engine credential.
pub const API_KEY_PARAM: &str = "x-typesense-api-key";

const MAX_BACKOFF_MS: u64 = 2400;

/// One call to the search engine, relative to its base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the engine root.
    pub path: String,
    /// Query parameters, credential included.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Vec<u8>>,
    /// Credential sent in the API key header.
    pub api_key: String,
}

/// Raw answer of the search engine. Only the content type survives of the headers.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    /// HTTP status.
    pub status: u16,
    /// Trimmed `Content-Type`, if any.
    pub content_type: Option<String>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a failed response into the error that relays it verbatim.
    pub fn into_error(self) -> ProxyError {
        ProxyError::Upstream {
            status: self.status,
            content_type: self.content_type,
            body: self.body,
        }
    }
}

/// Transport towards the search engine.
pub trait SearchBackend: Send + Sync {
    /// Execute one request. Terminal transport failures surface as `ProxyError::Transport`.
    fn call(&self, request: UpstreamRequest) -> impl Future<Output = Result<UpstreamResponse>> + Send;
}

/// HTTP transport with per-call timeout and exponential backoff on transport errors.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    attempts: usize,
    backoff: Duration,
}

impl HttpBackend {
    /// Client towards `upstream_url` with the configured timeout and retries.
    pub fn new(config: &ProxyConfig) -> Self {
        HttpBackend {
            client: reqwest::Client::new(),
            base_url: config.upstream_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            attempts: config.retries + 1,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send_once(&self, request: &UpstreamRequest) -> reqwest::Result<UpstreamResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path))
            .query(&request.query)
            .header(API_KEY_HEADER, request.api_key.as_str())
            .timeout(self.timeout);
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string());
        let body = response.bytes().await?.to_vec();

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

impl SearchBackend for HttpBackend {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(&request).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt >= self.attempts => {
                    tracing::error!(
                        "{} {} failed after {} attempts: {}",
                        request.method,
                        request.path,
                        attempt,
                        e
                    );
                    return Err(ProxyError::Transport(e.to_string()));
                }
                Err(e) => {
                    tracing::warn!(
                        "{} {} attempt {} failed, retrying in {:?}: {}",
                        request.method,
                        request.path,
                        attempt,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
                }
            }
        }
    }
}
