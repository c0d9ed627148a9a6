use crate::storefront::handler::{self, StorefrontState};
use crate::tracking::handler::{self as tracking, TrackingState};
use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Public read path, dashboard mutations and health.
///
/// The storefront reads are fetched by visitor browsers from the store's own
/// domain and carry [`public_cors`]; dashboard and health routes do not.
pub fn storefront_routes(state: Arc<StorefrontState>) -> Router {
    let public = Router::new()
        .route("/v1/storefront/{slug}", get(handler::get_storefront))
        .route(
            "/v1/storefront/{slug}/products",
            get(handler::get_storefront_products),
        )
        .layer(public_cors());

    Router::new()
        .route("/health", get(handler::health))
        .route("/v1/stores", post(handler::create_store))
        .route("/v1/stores/{slug}", put(handler::update_store))
        .route(
            "/v1/stores/{slug}/products/{product_id}",
            put(handler::upsert_product).delete(handler::delete_product),
        )
        .route(
            "/v1/stores/{slug}/social-links",
            put(handler::replace_social_links),
        )
        .route("/v1/stores/{slug}/design", put(handler::update_design))
        .route("/v1/stores/{slug}/analytics", get(handler::store_analytics))
        .merge(public)
        .with_state(state)
}

/// Page-view ingress. Callers add rate limiting on top.
pub fn tracking_routes(state: Arc<TrackingState>) -> Router {
    let max_payload = state.config.max_payload_bytes;
    Router::new()
        .route("/v1/track", post(tracking::track))
        .layer(DefaultBodyLimit::max(max_payload))
        .with_state(state)
}

/// CORS for visitor-facing routes: browsers on any storefront domain.
pub fn public_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::ChannelSink;
    use crate::cache::{CacheStore, MemoryStore, ReadThroughCache};
    use crate::config::TrackingConfig;
    use crate::storage::sqlite::test_pool;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn app(dir: &std::path::Path) -> (Router, mpsc::Receiver<crate::types::ProcessedPageView>) {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(100));
        let (tx, rx) = mpsc::channel(4);
        let sink = ChannelSink::new(tx);
        let cache = ReadThroughCache::new(store, true);
        let storefront = Arc::new(StorefrontState {
            pool: test_pool(dir).await,
            invalidator: cache.invalidator(),
            cache,
            ttl_secs: 600,
            tracking: sink.clone(),
        });
        let tracking = Arc::new(TrackingState {
            config: TrackingConfig::default(),
            sink,
        });
        (storefront_routes(storefront).merge(tracking_routes(tracking)), rx)
    }

    #[tokio::test]
    async fn test_invalid_slug_rejected_before_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = app(dir.path()).await;

        let resp = app
            .oneshot(
                Request::get("/v1/storefront/a:b")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_track_accepted_when_queue_full() {
        let dir = tempfile::tempdir().unwrap();
        let (app, mut rx) = app(dir.path()).await;
        let body = r#"{"storeId":"store-1","sessionId":"s1","utmParams":{"utm_source":"ig"}}"#;

        // capacity is 4; the fifth and sixth are dropped but still acknowledged
        for _ in 0..6 {
            let resp = app
                .clone()
                .oneshot(
                    Request::post("/v1/track")
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 4);
    }

    #[tokio::test]
    async fn test_oversized_track_body_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = app(dir.path()).await;
        let referrer = "x".repeat(TrackingConfig::default().max_payload_bytes + 1);
        let body = format!(r#"{{"storeId":"store-1","sessionId":"s1","referrer":"{referrer}"}}"#);

        let resp = app
            .oneshot(
                Request::post("/v1/track")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_storefront_reads_allow_any_origin() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = app(dir.path()).await;

        let resp = app
            .clone()
            .oneshot(
                Request::get("/v1/storefront/nobody")
                    .header(header::ORIGIN, "https://acme.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );

        let resp = app
            .clone()
            .oneshot(
                Request::options("/v1/storefront/acme/products")
                    .header(header::ORIGIN, "https://acme.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );

        // dashboard routes stay same-origin
        let resp = app
            .oneshot(
                Request::get("/v1/stores/acme/analytics")
                    .header(header::ORIGIN, "https://acme.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(!resp
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn test_view_from_oversized_landing_url_is_accepted() {
        use crate::analytics::{MemoryTabStorage, NavigationContext, SessionManager};

        let dir = tempfile::tempdir().unwrap();
        let (app, mut rx) = app(dir.path()).await;

        let mut query = format!("utm_source={}", "s".repeat(1000));
        for i in 0..40 {
            query.push_str(&format!("&utm_extra{i}={}", "v".repeat(400)));
        }
        let referrer = format!("https://t.co/{}", "r".repeat(10_000));
        let landing = NavigationContext::new(
            format!("https://shop.example/acme?{query}"),
            Some(&referrer),
        );
        let manager = SessionManager::new(Arc::new(MemoryTabStorage::new()));
        let session = manager.initialize("store-1", &landing).await;
        let body = serde_json::to_string(&session.page_view()).unwrap();

        let resp = app
            .oneshot(
                Request::post("/v1/track")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let view = rx.try_recv().unwrap();
        assert_eq!(view.event.session_id, session.session_id);
        assert!(view.event.utm_params.contains_key("utm_source"));
    }
}
