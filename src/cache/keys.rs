use once_cell::sync::Lazy;
use regex::Regex;

/// Prefix shared by every key that belongs to a tenant's public storefront.
pub const NAMESPACE: &str = "storefront";

/// Derived views cached next to the aggregate. Every entry here is removed by
/// [`tenant_keys`] on invalidation.
pub const DERIVED_VIEWS: &[&str] = &["products"];

const MAX_SLUG_LEN: usize = 63;

static SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9](?:-?[a-z0-9])*$").unwrap());

/// Key for the public aggregate of a store: `storefront:<slug>`.
pub fn storefront_key(slug: &str) -> String {
    format!("{NAMESPACE}:{slug}")
}

/// Key for a derived view of a store: `storefront:<slug>:<view>`.
pub fn derived_key(slug: &str, view: &str) -> String {
    format!("{NAMESPACE}:{slug}:{view}")
}

/// Every cache key scoped to `slug`.
pub fn tenant_keys(slug: &str) -> Vec<String> {
    let mut keys = Vec::with_capacity(1 + DERIVED_VIEWS.len());
    keys.push(storefront_key(slug));
    keys.extend(DERIVED_VIEWS.iter().map(|view| derived_key(slug, view)));
    keys
}

/// Slugs are lowercase alphanumerics separated by single dashes. The key
/// format relies on this: a slug can never contain `:`.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.len() <= MAX_SLUG_LEN && SLUG_RE.is_match(slug)
}
