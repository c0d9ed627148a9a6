pub mod analytics;
pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod routes;
pub mod storage;
pub mod storefront;
pub mod tracking;
pub mod types;
