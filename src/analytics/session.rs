//! Per-tab analytics session with first-touch attribution.
//!
//! A [`SessionManager`] moves through `Uninitialized -> Initializing -> Ready`
//! once per tab. The session id, referrer and UTM parameters are fixed when
//! the session is first created and persisted to [`TabStorage`]; later page
//! loads in the same tab reuse the stored record and never re-capture.

use crate::config::{
    DEFAULT_MAX_REFERRER_BYTES, DEFAULT_MAX_UTM_PARAMS, DEFAULT_MAX_UTM_VALUE_BYTES,
};
use crate::types::{PageViewEvent, UtmParams};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use url::Url;

/// Storage key for the persisted session record.
pub const SESSION_STORAGE_KEY: &str = "storefront.analytics_session";

/// Combined bytes of captured UTM keys and values. Together with the referrer
/// cap this keeps a page view well under the ingress payload limit.
const MAX_UTM_TOTAL_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("tab storage error: {0}")]
    Storage(String),
}

/// Tab-scoped key/value persistence (the browser's `sessionStorage`, or an
/// equivalent). Cleared when the tab goes away.
#[async_trait]
pub trait TabStorage: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), SessionError>;
    /// Drop everything, as when the tab is closed.
    async fn clear(&self) -> Result<(), SessionError>;
}

/// In-memory [`TabStorage`]. Clones share the same map, so two managers built
/// from clones of one `MemoryTabStorage` behave like two page loads in the
/// same tab.
#[derive(Clone, Default)]
pub struct MemoryTabStorage {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryTabStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TabStorage for MemoryTabStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let map = self
            .inner
            .lock()
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SessionError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionError> {
        self.inner
            .lock()
            .map_err(|e| SessionError::Storage(e.to_string()))?
            .clear();
        Ok(())
    }
}

/// Where the visitor is and how they got there.
#[derive(Debug, Clone, Default)]
pub struct NavigationContext {
    pub url: String,
    pub referrer: Option<String>,
}

impl NavigationContext {
    pub fn new(url: impl Into<String>, referrer: Option<&str>) -> Self {
        Self {
            url: url.into(),
            referrer: referrer.map(str::to_string),
        }
    }

    /// `utm_*` query parameters of the current URL. The first occurrence of a
    /// key wins; empty values are skipped. Relative URLs are accepted.
    ///
    /// Clamped to what the tracking ingress accepts: oversized keys are
    /// dropped, values are cut to the value limit, and capture stops at the
    /// parameter count or total size limit.
    pub fn utm_params(&self) -> UtmParams {
        let parsed = Url::parse(&self.url).or_else(|_| {
            Url::parse("http://localhost/").and_then(|base| base.join(&self.url))
        });
        let Ok(url) = parsed else {
            return UtmParams::new();
        };

        let mut params = UtmParams::new();
        let mut total = 0;
        for (key, value) in url.query_pairs() {
            if !key.starts_with("utm_")
                || value.is_empty()
                || key.len() > DEFAULT_MAX_UTM_VALUE_BYTES
                || params.contains_key(&*key)
            {
                continue;
            }
            let value = truncate_to_bytes(value.into_owned(), DEFAULT_MAX_UTM_VALUE_BYTES);
            if params.len() == DEFAULT_MAX_UTM_PARAMS
                || total + key.len() + value.len() > MAX_UTM_TOTAL_BYTES
            {
                tracing::debug!(kept = params.len(), "utm capture limit reached");
                break;
            }
            total += key.len() + value.len();
            params.insert(key.into_owned(), value);
        }
        params
    }

    fn first_touch_referrer(&self) -> Option<String> {
        self.referrer
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| truncate_to_bytes(r.to_string(), DEFAULT_MAX_REFERRER_BYTES))
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
fn truncate_to_bytes(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSession {
    pub session_id: String,
    pub store_id: String,
    pub referrer: Option<String>,
    #[serde(default)]
    pub utm_params: UtmParams,
    pub created_at: i64,
}

impl AnalyticsSession {
    fn capture(store_id: &str, nav: &NavigationContext) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            store_id: store_id.to_string(),
            referrer: nav.first_touch_referrer(),
            utm_params: nav.utm_params(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Page-view event carrying this session's first-touch attribution.
    pub fn page_view(&self) -> PageViewEvent {
        PageViewEvent {
            store_id: self.store_id.clone(),
            session_id: self.session_id.clone(),
            referrer: self.referrer.clone(),
            utm_params: self.utm_params.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initializing,
    Ready(AnalyticsSession),
}

impl SessionState {
    pub fn session(&self) -> Option<&AnalyticsSession> {
        match self {
            SessionState::Ready(session) => Some(session),
            _ => None,
        }
    }
}

/// Puts the state back to `Uninitialized` if initialization is abandoned
/// halfway, so a later call can retry.
struct InitGuard<'a> {
    state: &'a watch::Sender<SessionState>,
    done: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.state.send_if_modified(|state| {
                if matches!(state, SessionState::Initializing) {
                    *state = SessionState::Uninitialized;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Analytics session for one tab.
pub struct SessionManager<T: ?Sized = dyn TabStorage> {
    storage: Arc<T>,
    state: watch::Sender<SessionState>,
    last_tracked: Mutex<Option<(String, String)>>,
}

impl<T: TabStorage + ?Sized> SessionManager<T> {
    pub fn new(storage: Arc<T>) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        Self {
            storage,
            state,
            last_tracked: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Initializing)
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Ready(_))
    }

    pub fn session(&self) -> Option<AnalyticsSession> {
        self.state.borrow().session().cloned()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Wait until the session is ready. Pending forever if nobody calls
    /// [`initialize`](Self::initialize).
    pub async fn ready(&self) -> Option<AnalyticsSession> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, SessionState::Ready(_)))
            .await
            .ok()?;
        state.session().cloned()
    }

    /// Bring the session to `Ready` for `store_id`, loading the tab's persisted
    /// session or creating one from `nav`. Idempotent: once ready, later calls
    /// return the same session and ignore `nav`.
    pub async fn initialize(&self, store_id: &str, nav: &NavigationContext) -> AnalyticsSession {
        loop {
            let claimed = self.state.send_if_modified(|state| {
                if matches!(state, SessionState::Uninitialized) {
                    *state = SessionState::Initializing;
                    true
                } else {
                    false
                }
            });
            if claimed {
                break;
            }

            // Someone else is initializing (or already did); wait for them to
            // settle. An abandoned attempt drops back to Uninitialized and we
            // claim it on the next pass.
            let mut rx = self.state.subscribe();
            let settled = rx
                .wait_for(|state| !matches!(state, SessionState::Initializing))
                .await
                .map(|state| state.session().cloned());
            if let Ok(Some(session)) = settled {
                return session;
            }
        }

        let mut guard = InitGuard {
            state: &self.state,
            done: false,
        };

        let session = match self.load_persisted(store_id).await {
            Some(session) => {
                tracing::debug!(session_id = %session.session_id, "resumed analytics session");
                session
            }
            None => {
                let session = AnalyticsSession::capture(store_id, nav);
                self.persist(&session).await;
                tracing::debug!(
                    session_id = %session.session_id,
                    referrer = ?session.referrer,
                    utm_params = session.utm_params.len(),
                    "started analytics session"
                );
                session
            }
        };

        self.state.send_replace(SessionState::Ready(session.clone()));
        guard.done = true;
        session
    }

    /// Whether a page view for `page` should be sent now: the session is
    /// ready and this is a new (session, page) transition.
    ///
    /// Marks the transition as tracked when it returns true, before the view
    /// is sent. If that send then fails, re-rendering the same page does not
    /// send it again; the view is lost, in line with fire-and-forget tracking.
    pub fn should_track(&self, page: &str) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        if session.session_id.is_empty() {
            return false;
        }

        let transition = (session.session_id, page.to_string());
        let mut last = match self.last_tracked.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.as_ref() == Some(&transition) {
            return false;
        }
        *last = Some(transition);
        true
    }

    async fn load_persisted(&self, store_id: &str) -> Option<AnalyticsSession> {
        let raw = match self.storage.get(SESSION_STORAGE_KEY).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted analytics session");
                return None;
            }
        };

        match serde_json::from_str::<AnalyticsSession>(&raw) {
            Ok(session) if session.session_id.is_empty() => None,
            Ok(session) if session.store_id != store_id => {
                tracing::debug!(
                    previous_store = %session.store_id,
                    store_id,
                    "tab moved to another store, starting a new session"
                );
                None
            }
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(error = %e, "discarding corrupt analytics session record");
                None
            }
        }
    }

    async fn persist(&self, session: &AnalyticsSession) {
        let json = match serde_json::to_string(session) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize analytics session");
                return;
            }
        };
        if let Err(e) = self.storage.set(SESSION_STORAGE_KEY, &json).await {
            tracing::warn!(error = %e, "failed to persist analytics session, using it for this page only");
        }
    }
}
