use crate::config::{
    CONNECT_TIMEOUT_SECS, MAX_RETRIES, PROBE_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS,
    RETRY_BACKOFF_MAX_SECS, RETRY_BACKOFF_MS, RETRY_STATUSES, USER_AGENT,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl TransportError {
    // reqwest errors embed the request URL, which carries the key.
    fn network(e: reqwest::Error) -> Self {
        TransportError::Network(e.without_url().to_string())
    }
}

/// Retry budget for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub statuses: Vec<u16>,
    pub methods: Vec<Method>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff: Duration::from_millis(RETRY_BACKOFF_MS),
            max_backoff: Duration::from_secs(RETRY_BACKOFF_MAX_SECS),
            statuses: RETRY_STATUSES.to_vec(),
            methods: vec![Method::HEAD, Method::GET, Method::OPTIONS, Method::POST],
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.statuses.contains(&status.as_u16())
    }

    /// Sleep before retry number `retry` (0-based): base, 2x base, 4x base, ...
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_str(&self.body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Reachable,
    /// 403: the key is wrong or lacks permissions
    Unauthorized,
    Unexpected { status: u16, body: String },
}

/// HTTP access to the repository API. Every request carries the key as the
/// `key` query parameter.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    api_key: String,
    retry: RetryPolicy,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl ApiClient {
    pub fn new(api_base: &str, api_key: &str) -> Result<Self, TransportError> {
        let base = normalize_base(api_base)?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self {
            http,
            base,
            api_key: api_key.to_string(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ceiling for each `get`/`post_json` attempt
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Ceiling for the whole `probe` call
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `endpoint` relative to the API base, e.g. `items`
    pub fn endpoint(&self, endpoint: &str) -> Result<Url, TransportError> {
        self.base
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))
    }

    pub async fn get(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<ApiResponse, TransportError> {
        let url = self.endpoint(endpoint)?;
        self.send(Method::GET, url, None::<&()>, query, self.request_timeout, &self.retry)
            .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &T,
        query: &[(&str, &str)],
    ) -> Result<ApiResponse, TransportError> {
        let url = self.endpoint(endpoint)?;
        self.send(Method::POST, url, Some(body), query, self.request_timeout, &self.retry)
            .await
    }

    /// Checks reachability and credentials against `site`. Single attempt,
    /// so the probe timeout bounds the whole call.
    pub async fn probe(&self) -> Result<ProbeStatus, TransportError> {
        let url = self.endpoint("site")?;
        let response = self
            .send(
                Method::GET,
                url,
                None::<&()>,
                &[],
                self.probe_timeout,
                &RetryPolicy::none(),
            )
            .await?;

        Ok(match response.status {
            200 => ProbeStatus::Reachable,
            403 => ProbeStatus::Unauthorized,
            status => ProbeStatus::Unexpected {
                status,
                body: response.body,
            },
        })
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&T>,
        query: &[(&str, &str)],
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<ApiResponse, TransportError> {
        let retry_allowed = policy.allows(&method);
        let mut retries = 0u32;

        loop {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .query(&[("key", self.api_key.as_str())])
                .query(query)
                .timeout(timeout);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if retry_allowed
                        && retries < policy.max_retries
                        && policy.is_retryable_status(status)
                    {
                        let wait = retry_after(response.headers())
                            .map(|d| d.min(policy.max_backoff))
                            .unwrap_or_else(|| policy.backoff_for(retries));
                        retries += 1;
                        warn!(
                            method = %method,
                            path = url.path(),
                            status = status.as_u16(),
                            retry = retries,
                            wait_ms = wait.as_millis() as u64,
                            "Transient status, retrying"
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    let body = response.text().await.map_err(TransportError::network)?;
                    debug!(
                        method = %method,
                        path = url.path(),
                        status = status.as_u16(),
                        "Request complete"
                    );
                    return Ok(ApiResponse {
                        status: status.as_u16(),
                        body,
                    });
                }
                // A timed-out request may already have been handled by the
                // server; only a refused connection is safe to resend.
                Err(e) if retry_allowed && retries < policy.max_retries && is_unsent(&e) => {
                    let wait = policy.backoff_for(retries);
                    retries += 1;
                    warn!(
                        method = %method,
                        path = url.path(),
                        retry = retries,
                        error = %e.without_url(),
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(TransportError::network(e)),
            }
        }
    }
}

fn normalize_base(api_base: &str) -> Result<Url, TransportError> {
    let mut base = api_base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|e| TransportError::InvalidUrl(format!("{api_base}: {e}")))
}

fn is_unsent(e: &reqwest::Error) -> bool {
    e.is_connect() && !e.is_timeout()
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_with_or_without_trailing_slash() {
        let a = ApiClient::new("https://example.org/api", "k").unwrap();
        let b = ApiClient::new("https://example.org/api/", "k").unwrap();
        assert_eq!(a.endpoint("items").unwrap().as_str(), "https://example.org/api/items");
        assert_eq!(b.endpoint("items").unwrap().as_str(), "https://example.org/api/items");
        assert_eq!(a.endpoint("/site").unwrap().as_str(), "https://example.org/api/site");
    }

    #[test]
    fn invalid_base_is_rejected() {
        assert!(matches!(
            ApiClient::new("not a url", "k"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(1));
    }

    #[test]
    fn default_policy_matches_transient_set() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        for code in [429, 500, 502, 503, 504] {
            assert!(policy.is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400, 401, 403, 404, 422] {
            assert!(!policy.is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        assert!(policy.allows(&Method::POST));
        assert!(!policy.allows(&Method::DELETE));
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn response_helpers() {
        let ok = ApiResponse {
            status: 201,
            body: r#"{"id": 12}"#.to_string(),
        };
        assert!(ok.is_success());
        let value: serde_json::Value = ok.json().unwrap();
        assert_eq!(value["id"], 12);

        let bad = ApiResponse {
            status: 500,
            body: "<html>".to_string(),
        };
        assert!(!bad.is_success());
        assert!(matches!(
            bad.json::<serde_json::Value>(),
            Err(TransportError::Decode(_))
        ));
    }
}
