//! TOML + environment configuration.
//!
//! All tunables (batch size, retry counts, backoff parameters, cache TTL,
//! sync interval) are validated once at load time and never re-read mid-run.
//! The client secret may be supplied via `AZURE_CLIENT_SECRET` instead of the
//! config file so secrets stay out of version control.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub auth: AuthConfig,
    pub api: ApiConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub tenant_id: String,
    pub client_id: String,
    /// Falls back to the `AZURE_CLIENT_SECRET` environment variable.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Override for the token endpoint; defaults to the Microsoft identity
    /// platform v2 endpoint for `tenant_id`.
    #[serde(default)]
    pub token_endpoint: Option<String>,
}

impl AuthConfig {
    pub fn token_endpoint(&self) -> String {
        self.token_endpoint.clone().unwrap_or_else(|| {
            format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                self.tenant_id
            )
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Base URL of the F&O instance, e.g.
    /// `https://acme.operations.dynamics.com`.
    pub resource_url: String,
    /// Default legal entity for data queries.
    #[serde(default = "default_company")]
    pub company: String,
}

impl ApiConfig {
    pub fn metadata_url(&self) -> String {
        format!("{}/data/$metadata", self.resource_url.trim_end_matches('/'))
    }

    pub fn oauth_scope(&self) -> String {
        format!("{}/.default", self.resource_url.trim_end_matches('/'))
    }
}

fn default_company() -> String {
    "usmf".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,
    #[serde(default = "default_max_search_limit")]
    pub max_search_limit: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            max_search_limit: default_max_search_limit(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_ttl_hours() -> u32 {
    24
}
fn default_max_search_limit() -> i64 {
    100
}
fn default_batch_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_cap_secs")]
    pub retry_cap_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_interval_hours(),
            retry_base_secs: default_retry_base_secs(),
            retry_cap_secs: default_retry_cap_secs(),
        }
    }
}

fn default_interval_hours() -> u32 {
    12
}
fn default_retry_base_secs() -> u64 {
    30
}
fn default_retry_cap_secs() -> u64 {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7410".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.auth.client_secret.is_none() {
        config.auth.client_secret = std::env::var("AZURE_CLIENT_SECRET").ok();
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.auth.tenant_id.trim().is_empty() {
        anyhow::bail!("auth.tenant_id must not be empty");
    }
    if config.auth.client_id.trim().is_empty() {
        anyhow::bail!("auth.client_id must not be empty");
    }
    if config.auth.client_secret.as_deref().unwrap_or("").is_empty() {
        anyhow::bail!("auth.client_secret must be set (config file or AZURE_CLIENT_SECRET)");
    }

    if !config.api.resource_url.starts_with("http") {
        anyhow::bail!("api.resource_url must be an absolute URL");
    }

    if config.cache.batch_size == 0 {
        anyhow::bail!("cache.batch_size must be > 0");
    }
    if !(1..=1000).contains(&config.cache.max_search_limit) {
        anyhow::bail!("cache.max_search_limit must be in [1, 1000]");
    }
    if config.cache.ttl_hours == 0 {
        anyhow::bail!("cache.ttl_hours must be > 0");
    }

    if config.sync.interval_hours == 0 {
        anyhow::bail!("sync.interval_hours must be > 0");
    }
    if config.sync.retry_base_secs == 0 || config.sync.retry_base_secs > config.sync.retry_cap_secs
    {
        anyhow::bail!("sync.retry_base_secs must be > 0 and <= sync.retry_cap_secs");
    }

    if config.client.backoff_base_ms == 0
        || config.client.backoff_base_ms > config.client.backoff_cap_ms
    {
        anyhow::bail!("client.backoff_base_ms must be > 0 and <= client.backoff_cap_ms");
    }

    Ok(())
}
