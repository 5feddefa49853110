//! Token manager for the OAuth2 client-credentials flow.
//!
//! Caches the bearer credential and refreshes it before expiry. Concurrent
//! callers that arrive while a refresh is in flight all await the same
//! exchange future and receive the same credential (or the same failure) —
//! a cache miss under load performs exactly one exchange.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AuthError;

/// Seconds before expiry at which a cached credential is no longer served.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// A bearer token with its absolute expiry instant.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    fn is_fresh(&self, margin: Duration) -> bool {
        Utc::now() + margin < self.expires_at
    }
}

/// Seam to the identity provider. The production implementation posts a
/// client-credentials grant; tests substitute a counting fake.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self) -> Result<Credential, AuthError>;
}

/// Client-credentials exchange against the Microsoft identity platform.
pub struct ClientCredentialsExchange {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl ClientCredentialsExchange {
    pub fn from_config(config: &Config) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Endpoint {
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            endpoint: config.auth.token_endpoint(),
            client_id: config.auth.client_id.clone(),
            client_secret: config.auth.client_secret.clone().unwrap_or_default(),
            scope: config.api.oauth_scope(),
        })
    }
}

#[async_trait]
impl TokenExchange for ClientCredentialsExchange {
    async fn exchange(&self) -> Result<Credential, AuthError> {
        debug!(endpoint = %self.endpoint, scope = %self.scope, "requesting access token");

        let response = self
            .http
            .post(&self.endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Endpoint {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "token exchange rejected");
            return Err(AuthError::Exchange {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| AuthError::MalformedResponse {
                    reason: e.to_string(),
                })?;

        let expires_at = Utc::now() + Duration::seconds(token.expires_in);
        info!(%expires_at, "access token acquired");

        Ok(Credential {
            token: token.access_token,
            expires_at,
        })
    }
}

type SharedExchange = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

struct TokenCacheState {
    cached: Option<Credential>,
    in_flight: Option<SharedExchange>,
}

/// Caches credentials and coalesces concurrent refreshes.
pub struct TokenManager {
    exchange: Arc<dyn TokenExchange>,
    state: Mutex<TokenCacheState>,
    margin: Duration,
}

impl TokenManager {
    pub fn new(exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            exchange,
            state: Mutex::new(TokenCacheState {
                cached: None,
                in_flight: None,
            }),
            margin: Duration::seconds(EXPIRY_MARGIN_SECS),
        }
    }

    /// Returns a cached, non-expired credential, performing an exchange if
    /// none is cached or the cached one is within the safety margin.
    ///
    /// Exchange failures are not retried here; retry policy lives in the
    /// request client.
    pub async fn get_token(&self) -> Result<Credential, AuthError> {
        let fut = {
            let mut state = self.state.lock().await;

            if let Some(cached) = &state.cached {
                if cached.is_fresh(self.margin) {
                    return Ok(cached.clone());
                }
            }

            match &state.in_flight {
                Some(existing) => existing.clone(),
                None => {
                    let exchange = self.exchange.clone();
                    let fut = async move { exchange.exchange().await }.boxed().shared();
                    state.in_flight = Some(fut.clone());
                    fut
                }
            }
        };

        let result = fut.clone().await;

        let mut state = self.state.lock().await;
        if let Some(current) = &state.in_flight {
            if Shared::ptr_eq(current, &fut) {
                state.in_flight = None;
            }
        }
        if let Ok(credential) = &result {
            state.cached = Some(credential.clone());
        }

        result
    }

    /// Forces the next `get_token` to perform a fresh exchange.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.cached = None;
        debug!("cached credential invalidated");
    }
}
