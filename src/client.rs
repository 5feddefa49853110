//! Resilient HTTP client for the F&O OData API.
//!
//! Every outbound call is classified into a tagged outcome (success /
//! unauthorized / transient / terminal) and the retry loop acts on that tag.
//! Authorization failure forces a token refresh and retries the call exactly
//! once; transient failures are retried with exponential backoff and jitter.
//! The two retry dimensions compose: an auth-retry attempt is itself subject
//! to the transient envelope.

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::TokenManager;
use crate::config::Config;
use crate::error::{AuthError, RequestError};

/// Bounded exponential backoff with jitter for the transient retry class.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.client.max_retries,
            backoff_base: Duration::from_millis(config.client.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.client.backoff_cap_ms),
        }
    }

    /// Delay before retry `attempt` (1-based): exponential growth capped at
    /// `backoff_cap`, with the upper half randomized.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.backoff_cap);
        let half = capped / 2;
        let jitter_ms = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

/// An outbound request plus its retry-safety classification.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub accept: &'static str,
    pub body: Option<serde_json::Value>,
    /// Safe to retry after a response was received. GETs default to true;
    /// writes must opt in via [`RequestSpec::idempotent_safe`].
    pub idempotent: bool,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            accept: "application/json",
            body: None,
            idempotent: true,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            accept: "application/json",
            body: Some(body),
            idempotent: false,
        }
    }

    pub fn accept(mut self, accept: &'static str) -> Self {
        self.accept = accept;
        self
    }

    /// Marks a write as replay-safe (e.g. the caller supplies an idempotency
    /// token), enabling transient retries even after a response arrived.
    pub fn idempotent_safe(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

/// Per-attempt classification inspected by the retry loop.
enum Outcome {
    Success(reqwest::Response),
    Unauthorized,
    Transient {
        reason: String,
        received_response: bool,
    },
    Terminal {
        status: u16,
        body: String,
    },
}

/// Seam between the scheduler and the remote API: anything that can produce
/// the raw schema document for the configured instance.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self) -> Result<String, RequestError>;
}

/// HTTP client with transparent credential renewal and bounded retry.
pub struct ResilientClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    policy: RetryPolicy,
    metadata_url: String,
}

impl ResilientClient {
    pub fn new(config: &Config, tokens: Arc<TokenManager>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.client.timeout_secs))
            .build()?;

        Ok(Self::with_policy(
            http,
            tokens,
            RetryPolicy::from_config(config),
            config.api.metadata_url(),
        ))
    }

    pub fn with_policy(
        http: reqwest::Client,
        tokens: Arc<TokenManager>,
        policy: RetryPolicy,
        metadata_url: String,
    ) -> Self {
        Self {
            http,
            tokens,
            policy,
            metadata_url,
        }
    }

    /// Sends a request, renewing the credential on a 401 (once) and retrying
    /// transient failures per the policy.
    pub async fn send(&self, spec: &RequestSpec) -> Result<reqwest::Response, RequestError> {
        let mut auth_retried = false;
        let mut transient_attempts = 0u32;

        loop {
            let credential = self.tokens.get_token().await?;

            match self.attempt(spec, &credential.token).await {
                Outcome::Success(response) => return Ok(response),
                Outcome::Unauthorized => {
                    if auth_retried {
                        warn!(url = %spec.url, "second 401 after credential refresh");
                        return Err(AuthError::Unauthorized.into());
                    }
                    auth_retried = true;
                    info!(url = %spec.url, "401 received, refreshing credential and retrying once");
                    self.tokens.invalidate().await;
                }
                Outcome::Transient {
                    reason,
                    received_response,
                } => {
                    let retryable = spec.idempotent || !received_response;
                    if !retryable || transient_attempts >= self.policy.max_retries {
                        return Err(RequestError::Transient {
                            reason,
                            received_response,
                        });
                    }
                    transient_attempts += 1;
                    let delay = self.policy.delay(transient_attempts);
                    debug!(
                        url = %spec.url,
                        attempt = transient_attempts,
                        ?delay,
                        %reason,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Outcome::Terminal { status, body } => {
                    return Err(RequestError::Status { status, body });
                }
            }
        }
    }

    async fn attempt(&self, spec: &RequestSpec, token: &str) -> Outcome {
        let mut request = self
            .http
            .request(spec.method.clone(), &spec.url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, spec.accept);

        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            // Connection refused, DNS failure, timeout before headers — no
            // response was received, so even writes may retry.
            Err(e) => {
                return Outcome::Transient {
                    reason: e.to_string(),
                    received_response: false,
                }
            }
        };

        let status = response.status();
        if status.is_success() {
            return Outcome::Success(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Outcome::Unauthorized;
        }
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            return Outcome::Transient {
                reason: format!("status {}", status.as_u16()),
                received_response: true,
            };
        }

        let body = response.text().await.unwrap_or_default();
        Outcome::Terminal {
            status: status.as_u16(),
            body,
        }
    }

    /// Fetches the raw `$metadata` EDMX document.
    pub async fn fetch_metadata_document(&self) -> Result<String, RequestError> {
        let spec = RequestSpec::get(&self.metadata_url).accept("application/xml");
        let response = self.send(&spec).await?;
        let body = response
            .text()
            .await
            .map_err(|e| RequestError::Transient {
                reason: format!("body read failed: {}", e),
                received_response: true,
            })?;

        info!(size_bytes = body.len(), "metadata document fetched");
        Ok(body)
    }
}

#[async_trait]
impl DocumentSource for ResilientClient {
    async fn fetch_document(&self) -> Result<String, RequestError> {
        self.fetch_metadata_document().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, TokenExchange};
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::{HeaderMap, Response as HttpResponse};
    use axum::Router;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingExchange {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenExchange for CountingExchange {
        async fn exchange(&self) -> Result<Credential, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Credential {
                token: format!("tok-{}", n),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    struct Stub {
        hits: AtomicUsize,
        script: Mutex<VecDeque<u16>>,
        auth_headers: Mutex<Vec<String>>,
    }

    async fn stub_handler(State(stub): State<Arc<Stub>>, headers: HeaderMap) -> HttpResponse<Body> {
        stub.hits.fetch_add(1, Ordering::SeqCst);
        if let Some(auth) = headers.get(AUTHORIZATION) {
            stub.auth_headers
                .lock()
                .unwrap()
                .push(auth.to_str().unwrap_or_default().to_string());
        }
        let status = stub.script.lock().unwrap().pop_front().unwrap_or(200);
        HttpResponse::builder()
            .status(status)
            .body(Body::from("<stub/>"))
            .unwrap()
    }

    async fn spawn_stub(script: Vec<u16>) -> (Arc<Stub>, SocketAddr) {
        let stub = Arc::new(Stub {
            hits: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
            auth_headers: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .fallback(stub_handler)
            .with_state(stub.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (stub, addr)
    }

    fn test_client(addr: SocketAddr, max_retries: u32) -> (ResilientClient, Arc<CountingExchange>) {
        let exchange = Arc::new(CountingExchange {
            calls: AtomicUsize::new(0),
        });
        let tokens = Arc::new(TokenManager::new(exchange.clone()));
        let policy = RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
        };
        let client = ResilientClient::with_policy(
            reqwest::Client::new(),
            tokens,
            policy,
            format!("http://{}/data/$metadata", addr),
        );
        (client, exchange)
    }

    #[tokio::test]
    async fn unauthorized_then_ok_refreshes_and_retries_once() {
        let (stub, addr) = spawn_stub(vec![401, 200]).await;
        let (client, exchange) = test_client(addr, 3);

        let body = client.fetch_metadata_document().await.unwrap();
        assert_eq!(body, "<stub/>");
        assert_eq!(stub.hits.load(Ordering::SeqCst), 2);
        // One exchange for the initial token, one after invalidation.
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);

        let auth = stub.auth_headers.lock().unwrap().clone();
        assert_eq!(auth, vec!["Bearer tok-1", "Bearer tok-2"]);
    }

    #[tokio::test]
    async fn double_unauthorized_is_terminal() {
        let (stub, addr) = spawn_stub(vec![401, 401, 200]).await;
        let (client, _) = test_client(addr, 3);

        let err = client.fetch_metadata_document().await.unwrap_err();
        assert!(matches!(
            err,
            RequestError::Auth(AuthError::Unauthorized)
        ));
        // No third attempt against a genuinely broken credential.
        assert_eq!(stub.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_error_then_ok_is_retried() {
        let (stub, addr) = spawn_stub(vec![503, 200]).await;
        let (client, _) = test_client(addr, 3);

        client.fetch_metadata_document().await.unwrap();
        assert_eq!(stub.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_retries_are_bounded() {
        let (stub, addr) = spawn_stub(vec![503, 503, 503, 503, 503]).await;
        let (client, _) = test_client(addr, 2);

        let err = client.fetch_metadata_document().await.unwrap_err();
        assert!(err.is_transient());
        // Initial attempt plus two retries.
        assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_idempotent_write_is_not_replayed_after_response() {
        let (stub, addr) = spawn_stub(vec![503, 200]).await;
        let (client, _) = test_client(addr, 3);

        let spec = RequestSpec::post(
            format!("http://{}/data/Customers", addr),
            serde_json::json!({ "Name": "acme" }),
        );
        let err = client.send(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            RequestError::Transient {
                received_response: true,
                ..
            }
        ));
        assert_eq!(stub.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idempotent_safe_write_is_replayed() {
        let (stub, addr) = spawn_stub(vec![503, 200]).await;
        let (client, _) = test_client(addr, 3);

        let spec = RequestSpec::post(
            format!("http://{}/data/Customers", addr),
            serde_json::json!({ "Name": "acme" }),
        )
        .idempotent_safe();
        client.send(&spec).await.unwrap();
        assert_eq!(stub.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_error_is_terminal() {
        let (stub, addr) = spawn_stub(vec![404]).await;
        let (client, _) = test_client(addr, 3);

        let err = client.fetch_metadata_document().await.unwrap_err();
        assert!(matches!(err, RequestError::Status { status: 404, .. }));
        assert_eq!(stub.hits.load(Ordering::SeqCst), 1);
    }
}
