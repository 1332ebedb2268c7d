//! Retrying HTTP Transport
//!
//! Every control-plane call goes through `RetryingTransport`, which retries
//! rate-limited (429) responses with exponential backoff and surfaces any
//! other status of 400 or above as a `TransportError`. The backoff sleep is
//! an awaited suspension point on the injected `Clock`, so simulated clocks
//! can assert the arithmetic without waiting.
//!
//! ## Backoff arithmetic
//!
//! The first retry sleeps `retry_after` (expressed in milliseconds); each
//! subsequent retry multiplies the previous delay by `time_multiple`. A
//! request is attempted at most `max_retries + 1` times, after which a
//! still-rate-limited call fails with `RateLimitExhausted`.

use crate::clock::{Clock, ProductionClock};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Status code that triggers the retry loop
pub const HTTP_TOO_MANY_REQUESTS: u16 = 429;

// ============================================================================
// Errors
// ============================================================================

/// Error type for transport operations
#[derive(Debug)]
pub enum TransportError {
    /// Final response status was 400 or above
    Status { status: u16, body: String },
    /// 429 persisted past the retry budget
    RateLimitExhausted { retries: u32, body: String },
    /// Connection-level failure from the HTTP stack
    Request(reqwest::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Status { status, body } => {
                write!(f, "HTTP {}: {}", status, body)
            }
            TransportError::RateLimitExhausted { retries, body } => {
                write!(f, "Rate limited after {} retries: {}", retries, body)
            }
            TransportError::Request(e) => write!(f, "Request failed: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Request(e) => Some(e),
            TransportError::Status { .. } | TransportError::RateLimitExhausted { .. } => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Request(e)
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// HTTP method of an API request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// A single API request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        ApiRequest {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Set a header, replacing any earlier value of the same name
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Value of a header, if present (name compared case-insensitively)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A completed API response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as lossy UTF-8, for error reporting
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

// ============================================================================
// Single-attempt executors
// ============================================================================

/// Single-attempt request dispatch
///
/// `RetryingTransport` drives the retry loop; implementations only issue
/// one request. Implementations:
/// - `ReqwestExecutor`: production dispatch over a shared reqwest client
/// - `ScriptedExecutor`: canned responses for tests
pub trait HttpExecutor: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> BoxFuture<'a, Result<ApiResponse, TransportError>>;
}

/// Production executor over a shared reqwest client
#[derive(Debug, Clone, Default)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HttpExecutor for ReqwestExecutor {
    fn execute<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> BoxFuture<'a, Result<ApiResponse, TransportError>> {
        Box::pin(async move {
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&request.url),
                HttpMethod::Post => self.client.post(&request.url),
                HttpMethod::Put => self.client.put(&request.url),
                HttpMethod::Delete => self.client.delete(&request.url),
            };

            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?;

            Ok(ApiResponse { status, body })
        })
    }
}

// ============================================================================
// Backoff policy
// ============================================================================

/// Backoff policy for rate-limited requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffOptions {
    /// Delay before the first retry (configured in whole seconds)
    #[serde(with = "duration_secs")]
    pub retry_after: Duration,
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,
    /// Multiplicative growth factor applied to the delay per retry
    pub time_multiple: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        BackoffOptions {
            retry_after: Duration::from_secs(5),
            max_retries: 10,
            time_multiple: 2.0,
        }
    }
}

impl BackoffOptions {
    /// Options for tests (tiny delays, small budget)
    pub fn test() -> Self {
        BackoffOptions {
            retry_after: Duration::from_millis(10),
            max_retries: 2,
            time_multiple: 2.0,
        }
    }
}

/// Serde helper: Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ============================================================================
// Retrying transport
// ============================================================================

/// HTTP transport that retries rate-limited requests
///
/// Generic over the single-attempt executor and the clock so tests can
/// script responses and observe sleeps instead of serving real traffic.
pub struct RetryingTransport<E: HttpExecutor = ReqwestExecutor, C: Clock = ProductionClock> {
    executor: E,
    clock: C,
    backoff: BackoffOptions,
}

impl RetryingTransport {
    /// Production transport over reqwest and the tokio timer
    pub fn new(backoff: BackoffOptions) -> Self {
        Self::with_parts(ReqwestExecutor::new(), ProductionClock::new(), backoff)
    }
}

impl<E: HttpExecutor, C: Clock> RetryingTransport<E, C> {
    /// Transport with an explicit executor and clock (tests, simulations)
    pub fn with_parts(executor: E, clock: C, backoff: BackoffOptions) -> Self {
        RetryingTransport {
            executor,
            clock,
            backoff,
        }
    }

    pub fn backoff(&self) -> &BackoffOptions {
        &self.backoff
    }

    /// Send a request, retrying 429 responses with exponential backoff
    ///
    /// Returns the first non-429 response below 400. A final 429 after the
    /// retry budget is `RateLimitExhausted`; any other status of 400 or
    /// above is `Status` with the body attached, never retried.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut delay_ms = self.backoff.retry_after.as_millis() as u64;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let response = self.executor.execute(request).await?;

            if response.status == HTTP_TOO_MANY_REQUESTS {
                if attempt <= self.backoff.max_retries {
                    debug!(
                        method = request.method.as_str(),
                        url = %request.url,
                        attempt,
                        delay_ms,
                        "rate limited, backing off"
                    );
                    self.clock.sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms as f64 * self.backoff.time_multiple) as u64;
                    continue;
                }

                let body = response.body_string();
                error!(
                    method = request.method.as_str(),
                    url = %request.url,
                    retries = self.backoff.max_retries,
                    "rate limit retry budget exhausted"
                );
                return Err(TransportError::RateLimitExhausted {
                    retries: self.backoff.max_retries,
                    body,
                });
            }

            if response.status >= 400 {
                let body = response.body_string();
                error!(
                    method = request.method.as_str(),
                    url = %request.url,
                    status = response.status,
                    body = %body,
                    "request failed"
                );
                return Err(TransportError::Status {
                    status: response.status,
                    body,
                });
            }

            if response.status < 200 {
                error!(
                    method = request.method.as_str(),
                    url = %request.url,
                    status = response.status,
                    "unexpected informational status"
                );
            } else {
                debug!(
                    method = request.method.as_str(),
                    url = %request.url,
                    status = response.status,
                    "request succeeded"
                );
            }
            return Ok(response);
        }
    }
}

// ============================================================================
// ScriptedExecutor - canned responses for tests
// ============================================================================

/// Executor returning a scripted sequence of responses
///
/// Every request is recorded. Once the script runs dry, further requests
/// fail with a distinctive status so a test that under-scripts is loud.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    script: std::sync::Arc<parking_lot::Mutex<std::collections::VecDeque<ApiResponse>>>,
    requests: std::sync::Arc<parking_lot::Mutex<Vec<ApiRequest>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response with the given status and body
    pub fn push_response(&self, status: u16, body: &str) {
        self.script.lock().push_back(ApiResponse {
            status,
            body: Bytes::copy_from_slice(body.as_bytes()),
        });
    }

    /// Requests seen so far, in order
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl HttpExecutor for ScriptedExecutor {
    fn execute<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> BoxFuture<'a, Result<ApiResponse, TransportError>> {
        Box::pin(async move {
            self.requests.lock().push(request.clone());
            self.script.lock().pop_front().ok_or_else(|| TransportError::Status {
                status: 599,
                body: "scripted executor: no response queued".to_string(),
            })
        })
    }
}
