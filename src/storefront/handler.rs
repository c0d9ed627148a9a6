use crate::analytics::ChannelSink;
use crate::cache::keys::{derived_key, is_valid_slug, storefront_key};
use crate::cache::{Invalidator, ReadThroughCache};
use crate::error::{AppError, AppResult, LoggedJson};
use crate::storage::{page_views, tenant};
use crate::types::{
    AnalyticsQueryParams, CreateStore, HealthResponse, PageViewSummary, Product, SocialLink,
    StoreProfile, StorefrontData, UpdateDesign, UpdateStore, UpsertProduct,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use deadpool_sqlite::Pool;
use std::sync::Arc;

pub struct StorefrontState {
    pub pool: Pool,
    pub cache: ReadThroughCache,
    pub invalidator: Invalidator,
    pub ttl_secs: u64,
    pub tracking: ChannelSink,
}

const MAX_PRODUCT_ID_BYTES: usize = 128;

fn check_slug(slug: &str) -> AppResult<()> {
    if is_valid_slug(slug) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid store slug: {slug:?}")))
    }
}

fn store_not_found(slug: &str) -> AppError {
    AppError::NotFound(format!("store {slug} not found"))
}

async fn cached_storefront(state: &StorefrontState, slug: &str) -> AppResult<Option<StorefrontData>> {
    state
        .cache
        .get_cached_data(
            &storefront_key(slug),
            || tenant::load_storefront(&state.pool, slug),
            state.ttl_secs,
        )
        .await
}

/// GET /v1/storefront/{slug} - Public storefront aggregate.
pub async fn get_storefront(
    State(state): State<Arc<StorefrontState>>,
    Path(slug): Path<String>,
) -> AppResult<Json<StorefrontData>> {
    check_slug(&slug)?;
    cached_storefront(&state, &slug)
        .await?
        .map(Json)
        .ok_or_else(|| store_not_found(&slug))
}

/// GET /v1/storefront/{slug}/products - Visible products only.
pub async fn get_storefront_products(
    State(state): State<Arc<StorefrontState>>,
    Path(slug): Path<String>,
) -> AppResult<Json<Vec<Product>>> {
    check_slug(&slug)?;
    let products = state
        .cache
        .get_cached_data(
            &derived_key(&slug, "products"),
            || async {
                let data = cached_storefront(&state, &slug).await?;
                Ok::<_, AppError>(data.map(|d| d.products))
            },
            state.ttl_secs,
        )
        .await?;

    products.map(Json).ok_or_else(|| store_not_found(&slug))
}

/// POST /v1/stores - Create a store.
pub async fn create_store(
    State(state): State<Arc<StorefrontState>>,
    LoggedJson(input): LoggedJson<CreateStore>,
) -> AppResult<(StatusCode, Json<StoreProfile>)> {
    check_slug(&input.slug)?;
    if input.name.trim().is_empty() {
        return Err(AppError::Validation("name is required".to_string()));
    }

    let store = tenant::create_store(&state.pool, input).await?;
    // a miss for this slug may have been served before the store existed
    state.invalidator.invalidate(&store.slug).await;

    tracing::info!(slug = %store.slug, store_id = %store.id, "store created");
    Ok((StatusCode::CREATED, Json(store)))
}

/// PUT /v1/stores/{slug} - Update the store profile; may rename the slug.
pub async fn update_store(
    State(state): State<Arc<StorefrontState>>,
    Path(slug): Path<String>,
    LoggedJson(input): LoggedJson<UpdateStore>,
) -> AppResult<Json<StoreProfile>> {
    check_slug(&slug)?;
    if let Some(ref new_slug) = input.slug {
        check_slug(new_slug)?;
    }

    let (profile, old_slug) = tenant::update_store(&state.pool, &slug, input).await?;
    state.invalidator.invalidate(&old_slug).await;
    if profile.slug != old_slug {
        state.invalidator.invalidate(&profile.slug).await;
        tracing::info!(old_slug, new_slug = %profile.slug, "store renamed");
    }

    Ok(Json(profile))
}

/// PUT /v1/stores/{slug}/products/{product_id} - Create or replace a product.
pub async fn upsert_product(
    State(state): State<Arc<StorefrontState>>,
    Path((slug, product_id)): Path<(String, String)>,
    LoggedJson(input): LoggedJson<UpsertProduct>,
) -> AppResult<Json<serde_json::Value>> {
    check_slug(&slug)?;
    if product_id.is_empty() || product_id.len() > MAX_PRODUCT_ID_BYTES {
        return Err(AppError::Validation("invalid product id".to_string()));
    }
    if input.price_cents < 0 {
        return Err(AppError::Validation("price_cents must not be negative".to_string()));
    }

    tenant::upsert_product(&state.pool, &slug, &product_id, input).await?;
    state.invalidator.invalidate(&slug).await;

    Ok(Json(serde_json::json!({ "status": "ok", "product_id": product_id })))
}

/// DELETE /v1/stores/{slug}/products/{product_id}
pub async fn delete_product(
    State(state): State<Arc<StorefrontState>>,
    Path((slug, product_id)): Path<(String, String)>,
) -> AppResult<Json<serde_json::Value>> {
    check_slug(&slug)?;
    tenant::delete_product(&state.pool, &slug, &product_id).await?;
    state.invalidator.invalidate(&slug).await;

    Ok(Json(serde_json::json!({ "deleted": product_id })))
}

/// PUT /v1/stores/{slug}/social-links - Replace all social links.
pub async fn replace_social_links(
    State(state): State<Arc<StorefrontState>>,
    Path(slug): Path<String>,
    LoggedJson(links): LoggedJson<Vec<SocialLink>>,
) -> AppResult<Json<serde_json::Value>> {
    check_slug(&slug)?;
    let count = links.len();
    tenant::replace_social_links(&state.pool, &slug, links).await?;
    state.invalidator.invalidate(&slug).await;

    Ok(Json(serde_json::json!({ "status": "ok", "count": count })))
}

/// PUT /v1/stores/{slug}/design - Replace the design customization.
pub async fn update_design(
    State(state): State<Arc<StorefrontState>>,
    Path(slug): Path<String>,
    LoggedJson(input): LoggedJson<UpdateDesign>,
) -> AppResult<Json<serde_json::Value>> {
    check_slug(&slug)?;
    tenant::update_design(&state.pool, &slug, input).await?;
    state.invalidator.invalidate(&slug).await;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// GET /v1/stores/{slug}/analytics - Page-view summary for the last `hours`.
pub async fn store_analytics(
    State(state): State<Arc<StorefrontState>>,
    Path(slug): Path<String>,
    Query(params): Query<AnalyticsQueryParams>,
) -> AppResult<Json<PageViewSummary>> {
    check_slug(&slug)?;
    let store_id = tenant::store_id_for_slug(&state.pool, &slug)
        .await?
        .ok_or_else(|| store_not_found(&slug))?;

    let since = chrono::Utc::now().timestamp_millis() - params.hours() * 3_600_000;
    let summary = page_views::page_view_summary(&state.pool, &store_id, since).await?;
    Ok(Json(summary))
}

/// GET /health
pub async fn health(State(state): State<Arc<StorefrontState>>) -> Json<HealthResponse> {
    let db_ok = match state.pool.get().await {
        Ok(conn) => conn
            .interact(|conn| conn.execute_batch("SELECT 1"))
            .await
            .is_ok(),
        Err(_) => false,
    };

    Json(HealthResponse {
        status: if db_ok {
            "ok".into()
        } else {
            "degraded".into()
        },
        db_ok,
        cache_backend: state.cache.store().name().to_string(),
        cache: state.cache.stats(),
        buffer_usage: state.tracking.buffer_usage(),
    })
}
