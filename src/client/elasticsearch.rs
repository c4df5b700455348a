//! Elasticsearch client module
//!
//! Provides `ElasticsearchClient` for making REST requests to a cluster.

use super::Auth;
use crate::etl::{StoreError, retry_unreachable};
use crate::store::DEFAULT_RETRY_BACKOFF;
use base64::Engine;
use eyre::{Context, Result, bail};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Elasticsearch client for making API requests.
///
/// Connection failures surface as [`StoreError::Unreachable`] and are
/// retried once after the configured backoff.
///
/// # Example
/// ```no_run
/// use chunk_loader::client::{Auth, ElasticsearchClient};
/// use url::Url;
///
/// # async fn example() -> eyre::Result<()> {
/// let url = Url::parse("http://localhost:9200")?;
/// let client = ElasticsearchClient::try_new(url, Auth::None)?;
/// let response = client.get("/_cluster/health").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ElasticsearchClient {
    client: Client,
    url: Url,
    retry_backoff: Duration,
}

impl ElasticsearchClient {
    /// Create a new client from a URL and Auth.
    ///
    /// # Errors
    /// Returns an error if the auth header cannot be encoded or the HTTP
    /// client cannot be built.
    pub fn try_new(url: Url, auth: Auth) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        match auth {
            Auth::Basic(username, password) => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                headers.append(
                    reqwest::header::AUTHORIZATION,
                    format!("Basic {}", credentials).parse()?,
                );
            }
            Auth::Apikey(apikey) => {
                headers.append(
                    reqwest::header::AUTHORIZATION,
                    format!("ApiKey {}", apikey).parse()?,
                );
            }
            Auth::None => {}
        }
        let client = Client::builder().default_headers(headers).build()?;

        Ok(Self {
            client,
            url,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    /// Set the wait before retrying an unreachable host
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Send a request to a given path, retrying once if the host is down.
    ///
    /// # Arguments
    /// * `method` - HTTP method
    /// * `path` - API path, optionally with a query string
    /// * `content_type` - Content type of the body
    /// * `body` - Optional request body
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Option<&[u8]>,
    ) -> Result<reqwest::Response> {
        let what = format!("{} {}", method, path);
        retry_unreachable(self.retry_backoff, &what, || {
            self.request_once(method.clone(), path, content_type, body)
        })
        .await
    }

    async fn request_once(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Option<&[u8]>,
    ) -> Result<reqwest::Response> {
        let path_stripped = path.strip_prefix('/').unwrap_or(path);
        let url = self
            .url
            .join(path_stripped)
            .with_context(|| format!("Invalid request path: {}", path))?;

        let request = self.client.request(method, url);
        let request = match body {
            Some(body) => {
                log::trace!("Sending request with body");
                request
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(body.to_vec())
            }
            None => request,
        };

        request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                StoreError::Unreachable(format!("{}: {}", self.url, e)).into()
            } else {
                eyre::eyre!("Failed to send request: {}", e)
            }
        })
    }

    /// Helper for GET requests.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        self.request(Method::GET, path, "application/json", None).await
    }

    /// Helper for HEAD requests.
    pub async fn head(&self, path: &str) -> Result<reqwest::Response> {
        self.request(Method::HEAD, path, "application/json", None).await
    }

    /// Helper for DELETE requests.
    pub async fn delete(&self, path: &str) -> Result<reqwest::Response> {
        self.request(Method::DELETE, path, "application/json", None).await
    }

    /// Helper for PUT requests with JSON value.
    pub async fn put_json_value(&self, path: &str, value: &Value) -> Result<reqwest::Response> {
        let body = serde_json::to_vec(value)?;
        self.request(Method::PUT, path, "application/json", Some(&body)).await
    }

    /// Helper for POST requests with JSON value.
    pub async fn post_json_value(&self, path: &str, value: &Value) -> Result<reqwest::Response> {
        let body = serde_json::to_vec(value)?;
        self.request(Method::POST, path, "application/json", Some(&body)).await
    }

    /// Helper for POST requests with an NDJSON body (the `_bulk` API).
    pub async fn post_ndjson(&self, path: &str, body: &str) -> Result<reqwest::Response> {
        self.request(Method::POST, path, "application/x-ndjson", Some(body.as_bytes()))
            .await
    }
}

/// Parse a successful JSON response, or fail with the response body
pub async fn json_body(response: reqwest::Response, what: &str) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("Failed to {} ({}): {}", what, status, body);
    }
    response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", what))
}

/// True for a 404, used for missing indices
pub fn is_not_found(response: &reqwest::Response) -> bool {
    response.status() == StatusCode::NOT_FOUND
}

impl std::fmt::Display for ElasticsearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}
