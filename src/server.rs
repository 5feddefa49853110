//! JSON HTTP tool server.
//!
//! Exposes the metadata cache to MCP-style tool callers over a small JSON
//! API. Queries are served from the local cache only; the remote API is
//! never on the request path.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/search_entities` | Ranked name search within one record kind |
//! | `POST` | `/tools/get_entity` | Full entity descriptor by name |
//! | `POST` | `/tools/get_enum` | Enumeration with ordered members |
//! | `POST` | `/tools/trigger_sync` | Request a background sync cycle |
//! | `GET`  | `/tools/sync_status` | Scheduler state and cache counts |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no entity named CustGrp" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (503),
//! `internal` (500). `not_ready` is returned only while the cache is empty
//! and no sync has ever succeeded; once populated, stale data is served
//! rather than an error.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::error::StoreError;
use crate::models::{CachedRecord, EntityDescriptor, EnumDescriptor, RecordKind, SearchPage,
    SyncStatus};
use crate::store::{MetadataStore, StoreCounts};
use crate::sync::SyncScheduler;

#[derive(Clone)]
struct AppState {
    store: Arc<MetadataStore>,
    scheduler: Arc<SyncScheduler>,
}

/// Builds the application router. Split out from [`run_server`] so tests can
/// bind it to an ephemeral port.
pub fn router(store: Arc<MetadataStore>, scheduler: Arc<SyncScheduler>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/search_entities", post(handle_search))
        .route("/tools/get_entity", post(handle_get_entity))
        .route("/tools/get_enum", post(handle_get_enum))
        .route("/tools/trigger_sync", post(handle_trigger_sync))
        .route("/tools/sync_status", get(handle_sync_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { store, scheduler })
}

/// Binds to `[server].bind` and serves until the process terminates.
pub async fn run_server(
    config: &Config,
    store: Arc<MetadataStore>,
    scheduler: Arc<SyncScheduler>,
) -> anyhow::Result<()> {
    let app = router(store, scheduler);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "tool server listening");
    println!("Tool server listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn not_ready() -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "not_ready".to_string(),
        message: "cache is empty and no sync has completed yet".to_string(),
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: e.to_string(),
        }
    }
}

/// Queries are refused only on a cold start: an empty cache with no
/// successful sync ever. A populated cache is always served, stale or not.
async fn ensure_ready(state: &AppState) -> Result<(), AppError> {
    if state.scheduler.status().is_ready() {
        return Ok(());
    }
    let counts = state.store.counts().await?;
    if counts.entities == 0 && counts.enums == 0 {
        return Err(not_ready());
    }
    Ok(())
}

// ============ POST /tools/search_entities ============

#[derive(Deserialize)]
struct SearchRequest {
    pattern: String,
    /// One of `entity`, `field`, `relationship`, `enum`. Defaults to entity.
    #[serde(default)]
    kind: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    25
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchPage>, AppError> {
    ensure_ready(&state).await?;

    if req.pattern.trim().is_empty() {
        return Err(bad_request("pattern must not be empty"));
    }
    let kind = match req.kind.as_deref() {
        None => RecordKind::Entity,
        Some(s) => RecordKind::parse(s)
            .ok_or_else(|| bad_request(format!("unknown record kind: {}", s)))?,
    };

    let started = Instant::now();
    let page = state.store.search(kind, &req.pattern, req.limit, req.offset).await;
    let _ = state
        .store
        .record_usage(
            None,
            "search_entities",
            page.is_ok(),
            started.elapsed().as_millis() as i64,
        )
        .await;

    Ok(Json(page?))
}

// ============ POST /tools/get_entity, /tools/get_enum ============

#[derive(Deserialize)]
struct GetRequest {
    name: String,
}

#[derive(Serialize)]
struct GetEntityResponse {
    entity: EntityDescriptor,
    /// True when the record is past its TTL and a refresh is due.
    expired: bool,
}

#[derive(Serialize)]
struct GetEnumResponse {
    #[serde(rename = "enum")]
    enumeration: EnumDescriptor,
    expired: bool,
}

async fn handle_get_entity(
    State(state): State<AppState>,
    Json(req): Json<GetRequest>,
) -> Result<Json<GetEntityResponse>, AppError> {
    ensure_ready(&state).await?;
    if req.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }

    let started = Instant::now();
    let record = state.store.get(RecordKind::Entity, &req.name).await;
    let hit = matches!(record, Ok(Some(_)));
    let _ = state
        .store
        .record_usage(
            Some(&req.name),
            "get_entity",
            hit,
            started.elapsed().as_millis() as i64,
        )
        .await;

    match record? {
        Some(CachedRecord::Entity(entity)) => {
            let expired = state.store.is_expired(RecordKind::Entity, &req.name).await?;
            Ok(Json(GetEntityResponse { entity, expired }))
        }
        _ => Err(not_found(format!("no entity named {}", req.name))),
    }
}

async fn handle_get_enum(
    State(state): State<AppState>,
    Json(req): Json<GetRequest>,
) -> Result<Json<GetEnumResponse>, AppError> {
    ensure_ready(&state).await?;
    if req.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }

    let started = Instant::now();
    let record = state.store.get(RecordKind::Enum, &req.name).await;
    let hit = matches!(record, Ok(Some(_)));
    let _ = state
        .store
        .record_usage(
            Some(&req.name),
            "get_enum",
            hit,
            started.elapsed().as_millis() as i64,
        )
        .await;

    match record? {
        Some(CachedRecord::Enum(enumeration)) => {
            let expired = state.store.is_expired(RecordKind::Enum, &req.name).await?;
            Ok(Json(GetEnumResponse { enumeration, expired }))
        }
        _ => Err(not_found(format!("no enumeration named {}", req.name))),
    }
}

// ============ Sync endpoints ============

#[derive(Serialize)]
struct TriggerResponse {
    triggered: bool,
    status: SyncStatus,
}

async fn handle_trigger_sync(State(state): State<AppState>) -> Json<TriggerResponse> {
    state.scheduler.trigger().await;
    Json(TriggerResponse {
        triggered: true,
        status: state.scheduler.status(),
    })
}

#[derive(Serialize)]
struct SyncStatusResponse {
    #[serde(flatten)]
    status: SyncStatus,
    counts: StoreCounts,
}

async fn handle_sync_status(
    State(state): State<AppState>,
) -> Result<Json<SyncStatusResponse>, AppError> {
    Ok(Json(SyncStatusResponse {
        status: state.scheduler.status(),
        counts: state.store.counts().await?,
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
