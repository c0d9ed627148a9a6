use crate::cache::CacheStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Campaign attribution captured from `utm_*` query parameters.
pub type UtmParams = BTreeMap<String, String>;

/// Public store profile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoreProfile {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub currency: String,
    pub image_url: Option<String>,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SocialLink {
    pub platform: String,
    pub url: String,
}

/// Design customization is rendered elsewhere; the read path carries it as-is.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DesignCustomization {
    pub settings: serde_json::Value,
    pub updated_at: i64,
}

/// Everything a visitor-facing storefront page needs, loaded in one go and
/// cached under `storefront:<slug>`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StorefrontData {
    pub store: StoreProfile,
    pub products: Vec<Product>,
    pub social_links: Vec<SocialLink>,
    pub design: Option<DesignCustomization>,
}

/// One page view, as sent by the visitor's browser to the tracking ingress.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PageViewEvent {
    pub store_id: String,
    pub session_id: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub utm_params: UtmParams,
}

/// Page view with the server-assigned receive timestamp.
#[derive(Debug, Clone)]
pub struct ProcessedPageView {
    pub event: PageViewEvent,
    pub received_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateStore {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub logo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStore {
    pub slug: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub logo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertProduct {
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub currency: Option<String>,
    pub image_url: Option<String>,
    pub visible: Option<bool>,
    pub position: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDesign {
    pub settings: serde_json::Value,
}

/// Query params for analytics endpoints.
#[derive(Debug, Deserialize)]
pub struct AnalyticsQueryParams {
    pub hours: Option<i64>,
}

impl AnalyticsQueryParams {
    pub fn hours(&self) -> i64 {
        self.hours.unwrap_or(24).clamp(1, 24 * 90)
    }
}

#[derive(Debug, Serialize)]
pub struct CountEntry {
    pub value: String,
    pub count: i64,
}

/// Page-view rollup for one store.
#[derive(Debug, Serialize)]
pub struct PageViewSummary {
    pub store_id: String,
    pub since: i64,
    pub total_views: i64,
    pub unique_sessions: i64,
    pub top_referrers: Vec<CountEntry>,
    pub top_utm_sources: Vec<CountEntry>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub db_ok: bool,
    pub cache_backend: String,
    pub cache: CacheStats,
    pub buffer_usage: f64,
}
