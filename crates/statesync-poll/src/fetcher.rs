use futures_util::future::{BoxFuture, FutureExt};
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Request(e.to_string())
        }
    }
}

/// One pull against one source. Called once per scheduler tick.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

/// Wrap an async closure as a [`FetchFn`].
pub fn fetch_fn<F, Fut>(f: F) -> FetchFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// JSON-over-HTTP fetcher sharing one connection pool across sources.
#[derive(Clone)]
pub struct RestFetcher {
    client: Client,
}

impl RestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(15))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        get_json(&self.client, url).await
    }

    /// A [`FetchFn`] that GETs `url` on every call.
    pub fn source(&self, url: impl Into<String>) -> FetchFn {
        let client = self.client.clone();
        let url: Arc<str> = Arc::from(url.into());
        Arc::new(move || {
            let client = client.clone();
            let url = Arc::clone(&url);
            async move { get_json(&client, &url).await }.boxed()
        })
    }
}

async fn get_json(client: &Client, url: &str) -> Result<Value, FetchError> {
    debug!("GET {}", url);
    let response = client.get(url).send().await?;
    let status = response.status();

    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(FetchError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
}
