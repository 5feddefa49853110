//! End-to-end pipeline tests against an in-process stub of the F&O API:
//! token endpoint, metadata document, sync cycle, store queries, and the
//! HTTP tool surface.

use axum::body::Body;
use axum::extract::State;
use axum::http::Response as HttpResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use fometa::auth::{ClientCredentialsExchange, TokenManager};
use fometa::client::{DocumentSource, ResilientClient};
use fometa::config::Config;
use fometa::models::{CachedRecord, RecordKind, SyncState};
use fometa::server;
use fometa::store::MetadataStore;
use fometa::sync::{self, SyncScheduler};

const EDMX: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<edmx:Edmx Version="4.0" xmlns:edmx="http://docs.oasis-open.org/odata/ns/edmx">
  <edmx:DataServices>
    <Schema Namespace="Microsoft.Dynamics.DataEntities" xmlns="http://docs.oasis-open.org/odata/ns/edm">
      <EntityType Name="CustGroup">
        <Key>
          <PropertyRef Name="CustomerGroupId"/>
        </Key>
        <Property Name="CustomerGroupId" Type="Edm.String" Nullable="false"/>
        <Property Name="PaymentTerm" Type="Microsoft.Dynamics.DataEntities.PaymTermEnum"/>
        <NavigationProperty Name="Customers" Type="Collection(Microsoft.Dynamics.DataEntities.Customer)"/>
        <Annotation Term="Org.OData.Core.V1.Label" String="Customer groups"/>
      </EntityType>
      <EntityType Name="CustGroupExtended">
        <Property Name="CustomerGroupId" Type="Edm.String" Nullable="false"/>
      </EntityType>
      <EntityType Name="Customer">
        <Property Name="AccountNum" Type="Edm.String" Nullable="false"/>
      </EntityType>
      <EnumType Name="PaymTermEnum">
        <Member Name="Net10" Value="0"/>
        <Member Name="Net30" Value="1"/>
      </EnumType>
    </Schema>
  </edmx:DataServices>
</edmx:Edmx>"#;

struct StubApi {
    token_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
    // Status codes to serve for metadata requests, then 200 with the document.
    metadata_script: Mutex<VecDeque<u16>>,
}

async fn token_handler(State(stub): State<Arc<StubApi>>) -> Json<serde_json::Value> {
    let n = stub.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "access_token": format!("tok-{}", n), "expires_in": 3600 }))
}

async fn metadata_handler(State(stub): State<Arc<StubApi>>) -> HttpResponse<Body> {
    stub.metadata_calls.fetch_add(1, Ordering::SeqCst);
    let status = stub.metadata_script.lock().unwrap().pop_front().unwrap_or(200);
    if status == 200 {
        HttpResponse::builder()
            .status(200)
            .body(Body::from(EDMX))
            .unwrap()
    } else {
        HttpResponse::builder()
            .status(status)
            .body(Body::empty())
            .unwrap()
    }
}

async fn spawn_stub(metadata_script: Vec<u16>) -> (Arc<StubApi>, SocketAddr) {
    let stub = Arc::new(StubApi {
        token_calls: AtomicUsize::new(0),
        metadata_calls: AtomicUsize::new(0),
        metadata_script: Mutex::new(metadata_script.into()),
    });
    let app = Router::new()
        .route("/token", post(token_handler))
        .fallback(metadata_handler)
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (stub, addr)
}

fn test_config(api_addr: SocketAddr, dir: &TempDir) -> Config {
    toml::from_str(&format!(
        r#"
[auth]
tenant_id = "tenant-guid"
client_id = "client-guid"
client_secret = "s3cret"
token_endpoint = "http://{addr}/token"

[api]
resource_url = "http://{addr}"

[db]
path = "{db}"

[client]
backoff_base_ms = 1
backoff_cap_ms = 4

[sync]
retry_base_secs = 1
retry_cap_secs = 2
"#,
        addr = api_addr,
        db = dir.path().join("fometa.sqlite").display()
    ))
    .unwrap()
}

fn build_client(cfg: &Config) -> ResilientClient {
    let exchange = Arc::new(ClientCredentialsExchange::from_config(cfg).unwrap());
    let tokens = Arc::new(TokenManager::new(exchange));
    ResilientClient::new(cfg, tokens).unwrap()
}

#[tokio::test]
async fn full_cycle_populates_the_cache() {
    let (stub, addr) = spawn_stub(vec![]).await;
    let dir = TempDir::new().unwrap();
    let cfg = test_config(addr, &dir);

    let store = MetadataStore::open(&cfg).await.unwrap();
    let client = build_client(&cfg);

    let summary = sync::run_once(&client, &store, cfg.cache.batch_size)
        .await
        .unwrap();
    assert_eq!(summary.entities, 3);
    assert_eq!(summary.enums, 1);
    assert!(summary.warnings.is_empty());
    assert_eq!(stub.token_calls.load(Ordering::SeqCst), 1);

    let page = store
        .search(RecordKind::Entity, "CustGroup", 10, 0)
        .await
        .unwrap();
    let names: Vec<&str> = page.hits.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, vec!["CustGroup", "CustGroupExtended"]);

    let entity = match store.get(RecordKind::Entity, "CustGroup").await.unwrap() {
        Some(CachedRecord::Entity(e)) => e,
        other => panic!("unexpected: {:?}", other),
    };
    assert_eq!(entity.label.as_deref(), Some("Customer groups"));
    assert_eq!(entity.fields.len(), 2);
    assert_eq!(entity.fields[1].enum_ref.as_deref(), Some("PaymTermEnum"));
    assert_eq!(entity.relationships.len(), 1);

    assert!(store.last_successful_sync().await.unwrap().is_some());
    store.close().await;
}

#[tokio::test]
async fn sync_recovers_from_a_stale_credential() {
    let (stub, addr) = spawn_stub(vec![401]).await;
    let dir = TempDir::new().unwrap();
    let cfg = test_config(addr, &dir);

    let store = MetadataStore::open(&cfg).await.unwrap();
    let client = build_client(&cfg);

    let summary = sync::run_once(&client, &store, cfg.cache.batch_size)
        .await
        .unwrap();
    assert_eq!(summary.entities, 3);

    // The rejected call forced one token refresh and one retry.
    assert_eq!(stub.token_calls.load(Ordering::SeqCst), 2);
    assert_eq!(stub.metadata_calls.load(Ordering::SeqCst), 2);
    store.close().await;
}

async fn spawn_tool_server(
    store: Arc<MetadataStore>,
    scheduler: Arc<SyncScheduler>,
) -> SocketAddr {
    let app = server::router(store, scheduler);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn tool_server_answers_from_the_cache() {
    let (_stub, addr) = spawn_stub(vec![]).await;
    let dir = TempDir::new().unwrap();
    let cfg = test_config(addr, &dir);

    let store = Arc::new(MetadataStore::open(&cfg).await.unwrap());
    let client: Arc<dyn DocumentSource> = Arc::new(build_client(&cfg));
    let scheduler = Arc::new(SyncScheduler::spawn(
        client,
        store.clone(),
        cfg.cache.batch_size,
        cfg.sync.clone(),
    ));
    scheduler
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    let tool_addr = spawn_tool_server(store, scheduler).await;
    let http = reqwest::Client::new();

    let health: serde_json::Value = http
        .get(format!("http://{}/health", tool_addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let page: serde_json::Value = http
        .post(format!("http://{}/tools/search_entities", tool_addr))
        .json(&json!({ "pattern": "CustGroup" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 2);
    assert_eq!(page["hits"][0]["name"], "CustGroup");

    let entity: serde_json::Value = http
        .post(format!("http://{}/tools/get_entity", tool_addr))
        .json(&json!({ "name": "CustGroup" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(entity["entity"]["name"], "CustGroup");
    assert_eq!(entity["expired"], false);

    let missing = http
        .post(format!("http://{}/tools/get_entity", tool_addr))
        .json(&json!({ "name": "NoSuchEntity" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let status: serde_json::Value = http
        .get(format!("http://{}/tools/sync_status", tool_addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "idle");
    assert_eq!(status["counts"]["entities"], 3);
}

#[tokio::test]
async fn tool_server_refuses_queries_on_a_cold_empty_cache() {
    // Metadata endpoint fails forever, so the cache never fills.
    let (_stub, addr) = spawn_stub(vec![500; 64]).await;
    let dir = TempDir::new().unwrap();
    let cfg = test_config(addr, &dir);

    let store = Arc::new(MetadataStore::open(&cfg).await.unwrap());
    let client: Arc<dyn DocumentSource> = Arc::new(build_client(&cfg));
    let scheduler = Arc::new(SyncScheduler::spawn(
        client,
        store.clone(),
        cfg.cache.batch_size,
        cfg.sync.clone(),
    ));

    let tool_addr = spawn_tool_server(store, scheduler.clone()).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/tools/search_entities", tool_addr))
        .json(&json!({ "pattern": "Cust" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_ready");

    // Status stays reachable and reports the failure.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = scheduler.status();
    assert_eq!(status.state, SyncState::Failed);
    assert!(status.consecutive_failures >= 1);
}
