use crate::analytics::{ChannelSink, TrackError, TrackingSink};
use crate::config::TrackingConfig;
use crate::error::{AppError, AppResult, LoggedJson};
use crate::types::PageViewEvent;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;

pub struct TrackingState {
    pub config: TrackingConfig,
    pub sink: ChannelSink,
}

/// Validate a page view against size limits.
fn validate_page_view(event: &PageViewEvent, config: &TrackingConfig) -> AppResult<()> {
    if event.store_id.is_empty() {
        return Err(AppError::Validation("storeId is required".to_string()));
    }
    if event.session_id.is_empty() {
        return Err(AppError::Validation("sessionId is required".to_string()));
    }
    if event.store_id.len() > config.max_id_bytes {
        return Err(AppError::Validation(format!(
            "storeId exceeds {} bytes",
            config.max_id_bytes
        )));
    }
    if event.session_id.len() > config.max_id_bytes {
        return Err(AppError::Validation(format!(
            "sessionId exceeds {} bytes",
            config.max_id_bytes
        )));
    }
    if let Some(ref referrer) = event.referrer {
        if referrer.len() > config.max_referrer_bytes {
            return Err(AppError::Validation(format!(
                "referrer exceeds {} bytes",
                config.max_referrer_bytes
            )));
        }
    }
    if event.utm_params.len() > config.max_utm_params {
        return Err(AppError::Validation(format!(
            "more than {} utm params",
            config.max_utm_params
        )));
    }
    for (key, value) in &event.utm_params {
        if !key.starts_with("utm_") {
            return Err(AppError::Validation(format!("unexpected param {key}")));
        }
        if key.len() > config.max_utm_value_bytes || value.len() > config.max_utm_value_bytes {
            return Err(AppError::Validation(format!(
                "{key} exceeds {} bytes",
                config.max_utm_value_bytes
            )));
        }
    }
    Ok(())
}

/// POST /v1/track - Record one page view.
pub async fn track(
    State(state): State<Arc<TrackingState>>,
    LoggedJson(event): LoggedJson<PageViewEvent>,
) -> AppResult<Json<serde_json::Value>> {
    validate_page_view(&event, &state.config)?;

    // Backpressure: ACK 200 even if dropped
    let store_id = event.store_id.clone();
    match state.sink.record(event).await {
        Ok(()) => {}
        Err(TrackError::QueueFull) => {
            tracing::warn!(store_id, "tracking channel full, page view dropped");
        }
        Err(e) => {
            tracing::warn!(error = %e, store_id, "page view dropped");
        }
    }

    Ok(Json(serde_json::json!({ "status": "accepted" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UtmParams;

    fn event() -> PageViewEvent {
        let mut utm = UtmParams::new();
        utm.insert("utm_source".into(), "ig".into());
        PageViewEvent {
            store_id: "store-1".into(),
            session_id: "4b1c6f0e-0000-4000-8000-000000000000".into(),
            referrer: Some("https://twitter.com".into()),
            utm_params: utm,
        }
    }

    #[test]
    fn test_valid_page_view() {
        assert!(validate_page_view(&event(), &TrackingConfig::default()).is_ok());
    }

    #[test]
    fn test_missing_session_rejected() {
        let mut e = event();
        e.session_id.clear();
        let err = validate_page_view(&e, &TrackingConfig::default()).unwrap_err();
        assert!(err.to_string().contains("sessionId"));
    }

    #[test]
    fn test_oversized_referrer_rejected() {
        let config = TrackingConfig::default();
        let mut e = event();
        e.referrer = Some("x".repeat(config.max_referrer_bytes + 1));
        assert!(validate_page_view(&e, &config).is_err());
    }

    #[test]
    fn test_too_many_utm_params_rejected() {
        let config = TrackingConfig::default();
        let mut e = event();
        for i in 0..=config.max_utm_params {
            e.utm_params.insert(format!("utm_x{i}"), "v".into());
        }
        assert!(validate_page_view(&e, &config).is_err());
    }

    #[test]
    fn test_non_utm_key_rejected() {
        let mut e = event();
        e.utm_params.insert("gclid".into(), "abc".into());
        assert!(validate_page_view(&e, &TrackingConfig::default()).is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let raw = r#"{"storeId":"s","sessionId":"x","ip":"1.2.3.4"}"#;
        assert!(serde_json::from_str::<PageViewEvent>(raw).is_err());
    }
}
