use std::net::SocketAddr;
use std::sync::Arc;
use storefront::analytics::{
    HttpSink, MemoryTabStorage, NavigationContext, PageViewTracker, SessionManager,
};
use storefront::cache::{CacheStore, MemoryStore, ReadThroughCache};
use storefront::config::{PipelineConfig, TrackingConfig};
use storefront::storefront::handler::StorefrontState;
use storefront::tracking::handler::TrackingState;
use storefront::types::ProcessedPageView;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    _handle: tokio::task::JoinHandle<()>,
}

async fn spawn_server() -> TestServer {
    // Create temp db
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let db_path = tmp.path().to_path_buf();
    // Keep tmp alive by leaking it (test only)
    std::mem::forget(tmp);

    let pool = storefront::storage::sqlite::create_pool(&storefront::config::DatabaseConfig {
        path: db_path,
        pool_size: 4,
    })
    .unwrap();
    storefront::storage::sqlite::init_pool(&pool).await.unwrap();

    let (tx, rx) = mpsc::channel::<ProcessedPageView>(1024);

    // Spawn worker
    let worker_pool = pool.clone();
    let pipeline_config = PipelineConfig {
        flush_interval_secs: 1,
        flush_batch_size: 100,
    };
    tokio::spawn(async move {
        storefront::pipeline::worker::run_worker(rx, worker_pool, pipeline_config).await;
    });

    let store = Arc::new(MemoryStore::new(1_000));
    let dyn_store: Arc<dyn CacheStore> = store.clone();
    let sink = storefront::analytics::ChannelSink::new(tx);

    let cache = ReadThroughCache::new(dyn_store, true);
    let storefront_state = Arc::new(StorefrontState {
        pool,
        invalidator: cache.invalidator(),
        cache,
        ttl_secs: 600,
        tracking: sink.clone(),
    });
    let tracking_state = Arc::new(TrackingState {
        config: TrackingConfig::default(),
        sink,
    });

    let app = storefront::routes::storefront_routes(storefront_state)
        .merge(storefront::routes::tracking_routes(tracking_state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        store,
        _handle: handle,
    }
}

async fn create_acme(client: &reqwest::Client, addr: SocketAddr) -> serde_json::Value {
    let resp = client
        .post(format!("http://{addr}/v1/stores"))
        .json(&serde_json::json!({
            "slug": "acme",
            "name": "Acme",
            "description": "Anvils and more",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

async fn put_product(client: &reqwest::Client, addr: SocketAddr, id: &str, name: &str, price: i64) {
    let resp = client
        .put(format!("http://{addr}/v1/stores/acme/products/{id}"))
        .json(&serde_json::json!({
            "name": name,
            "price_cents": price,
            "position": 0,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_health() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{}/health", server.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db_ok"], true);
    assert_eq!(body["cache_backend"], "memory");
    assert_eq!(body["cache"]["hits"], 0);
}

#[tokio::test]
async fn test_unknown_store_is_not_found_and_not_cached() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{}/v1/storefront/nobody", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(!server.store.contains("storefront:nobody").await);

    let resp = client
        .get(format!("http://{}/v1/storefront/Not_A_Slug", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_read_hit_invalidate_reload() {
    let server = spawn_server().await;
    let addr = server.addr;
    let client = reqwest::Client::new();

    create_acme(&client, addr).await;
    put_product(&client, addr, "anvil", "Anvil", 4999).await;

    // First read fills the cache
    let resp = client
        .get(format!("http://{addr}/v1/storefront/acme"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["store"]["name"], "Acme");
    assert_eq!(body["products"][0]["name"], "Anvil");
    assert!(server.store.contains("storefront:acme").await);

    // Second read is served from cache
    let resp = client
        .get(format!("http://{addr}/v1/storefront/acme"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let health: serde_json::Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["cache"]["hits"], 1);
    assert_eq!(health["cache"]["fills"], 1);

    // Mutation invalidates
    put_product(&client, addr, "anvil", "Anvil Pro", 5999).await;
    assert!(!server.store.contains("storefront:acme").await);

    // Next read reloads the new data
    let body: serde_json::Value = client
        .get(format!("http://{addr}/v1/storefront/acme"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["products"][0]["name"], "Anvil Pro");
    assert_eq!(body["products"][0]["price_cents"], 5999);
}

#[tokio::test]
async fn test_products_view_is_invalidated_with_aggregate() {
    let server = spawn_server().await;
    let addr = server.addr;
    let client = reqwest::Client::new();

    create_acme(&client, addr).await;
    put_product(&client, addr, "anvil", "Anvil", 4999).await;

    let products: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/v1/storefront/acme/products"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(products.len(), 1);
    assert!(server.store.contains("storefront:acme:products").await);

    let resp = client
        .delete(format!("http://{addr}/v1/stores/acme/products/anvil"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(!server.store.contains("storefront:acme:products").await);

    let products: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/v1/storefront/acme/products"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(products.is_empty());
}

#[tokio::test]
async fn test_rename_invalidates_old_and_new_slug() {
    let server = spawn_server().await;
    let addr = server.addr;
    let client = reqwest::Client::new();

    create_acme(&client, addr).await;

    // Warm the old slug and seed a stale entry under the new one
    client
        .get(format!("http://{addr}/v1/storefront/acme"))
        .send()
        .await
        .unwrap();
    server
        .store
        .set(
            "storefront:acme-co",
            "{\"stale\":true}".to_string(),
            std::time::Duration::from_secs(600),
        )
        .await
        .unwrap();

    let resp = client
        .put(format!("http://{addr}/v1/stores/acme"))
        .json(&serde_json::json!({ "slug": "acme-co" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    assert!(!server.store.contains("storefront:acme").await);
    assert!(!server.store.contains("storefront:acme-co").await);

    let resp = client
        .get(format!("http://{addr}/v1/storefront/acme"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let body: serde_json::Value = client
        .get(format!("http://{addr}/v1/storefront/acme-co"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["store"]["slug"], "acme-co");
}

#[tokio::test]
async fn test_duplicate_store_conflicts() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    create_acme(&client, server.addr).await;
    let resp = client
        .post(format!("http://{}/v1/stores", server.addr))
        .json(&serde_json::json!({ "slug": "acme", "name": "Other" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn test_track_rejects_invalid_payload() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/v1/track", server.addr))
        .json(&serde_json::json!({ "storeId": "s", "sessionId": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("http://{}/v1/track", server.addr))
        .json(&serde_json::json!({ "storeId": "s", "sessionId": "x", "ip": "1.2.3.4" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_visitor_session_tracks_first_touch_attribution() {
    let server = spawn_server().await;
    let addr = server.addr;
    let client = reqwest::Client::new();

    let store = create_acme(&client, addr).await;
    let store_id = store["id"].as_str().unwrap().to_string();

    // One browser tab: land from twitter with utm_source=ig, then navigate
    let tracker = PageViewTracker::new(Arc::new(HttpSink::with_client(
        client.clone(),
        format!("http://{addr}/v1/track"),
    )));
    let tab = MemoryTabStorage::new();

    let landing = NavigationContext::new(
        format!("http://{addr}/acme?utm_source=ig"),
        Some("https://twitter.com"),
    );
    let page = SessionManager::new(Arc::new(tab.clone()));
    tracker
        .on_page_load(&page, &store_id, &landing, "/acme")
        .await
        .unwrap()
        .await
        .unwrap();

    // Full reload of another page in the same tab
    let internal = NavigationContext::new(
        format!("http://{addr}/acme/products"),
        Some(format!("http://{addr}/acme").as_str()),
    );
    let reloaded = SessionManager::new(Arc::new(tab.clone()));
    tracker
        .on_page_load(&reloaded, &store_id, &internal, "/acme/products")
        .await
        .unwrap()
        .await
        .unwrap();

    // Wait for pipeline flush (flush_interval_secs = 1)
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let summary: serde_json::Value = client
        .get(format!("http://{addr}/v1/stores/acme/analytics?hours=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(summary["store_id"], store_id);
    assert_eq!(summary["total_views"], 2);
    assert_eq!(summary["unique_sessions"], 1);
    assert_eq!(summary["top_referrers"][0]["value"], "https://twitter.com");
    assert_eq!(summary["top_referrers"][0]["count"], 2);
    assert_eq!(summary["top_utm_sources"][0]["value"], "ig");
    assert_eq!(summary["top_utm_sources"][0]["count"], 2);
}
