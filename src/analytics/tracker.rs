//! Fire-and-forget page-view recording.
//!
//! [`PageViewTracker`] hands each event to a [`TrackingSink`] on a spawned
//! task. Errors are logged there and never reach the caller; nothing is
//! retried. The returned `JoinHandle` is only for shutdown and tests; page
//! rendering must not wait on it.

use crate::analytics::session::{NavigationContext, SessionManager, TabStorage};
use crate::types::{PageViewEvent, ProcessedPageView};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracking ingress rejected page view with status {0}")]
    Rejected(u16),

    #[error("tracking queue full")]
    QueueFull,

    #[error("tracking queue closed")]
    QueueClosed,
}

/// Durable destination for page views.
#[async_trait]
pub trait TrackingSink: Send + Sync + 'static {
    async fn record(&self, event: PageViewEvent) -> Result<(), TrackError>;
}

/// Posts page views to the tracking ingress (`POST /v1/track`).
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TrackingSink for HttpSink {
    async fn record(&self, event: PageViewEvent) -> Result<(), TrackError> {
        let resp = self.client.post(&self.endpoint).json(&event).send().await?;
        if !resp.status().is_success() {
            return Err(TrackError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Queues page views for the in-process pipeline worker. Stamps the receive
/// time; never waits for queue space.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ProcessedPageView>,
    capacity: usize,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ProcessedPageView>) -> Self {
        let capacity = tx.max_capacity();
        Self { tx, capacity }
    }

    /// Fraction of the queue currently occupied.
    pub fn buffer_usage(&self) -> f64 {
        1.0 - (self.tx.capacity() as f64 / self.capacity as f64)
    }
}

#[async_trait]
impl TrackingSink for ChannelSink {
    async fn record(&self, event: PageViewEvent) -> Result<(), TrackError> {
        let view = ProcessedPageView {
            event,
            received_at: chrono::Utc::now().timestamp_millis(),
        };
        self.tx.try_send(view).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TrackError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TrackError::QueueClosed,
        })
    }
}

#[derive(Clone)]
pub struct PageViewTracker {
    sink: Arc<dyn TrackingSink>,
}

impl PageViewTracker {
    pub fn new(sink: Arc<dyn TrackingSink>) -> Self {
        Self { sink }
    }

    /// Dispatch one page view. Refuses events without a session id.
    pub fn track_page_view(&self, event: PageViewEvent) -> Option<JoinHandle<()>> {
        if event.session_id.is_empty() || event.store_id.is_empty() {
            tracing::debug!("page view without session, not sending");
            return None;
        }

        let sink = self.sink.clone();
        Some(tokio::spawn(async move {
            let store_id = event.store_id.clone();
            let session_id = event.session_id.clone();
            if let Err(e) = sink.record(event).await {
                tracing::warn!(error = %e, store_id, session_id, "page view dropped");
            }
        }))
    }

    /// Track `page` for the manager's session. No-op until the session is
    /// ready, and for repeats of the last tracked page. A page whose send
    /// failed still counts as tracked, so re-rendering it sends nothing.
    pub fn track_for_session<T: TabStorage + ?Sized>(
        &self,
        manager: &SessionManager<T>,
        page: &str,
    ) -> Option<JoinHandle<()>> {
        let session = manager.session()?;
        if !manager.should_track(page) {
            return None;
        }
        self.track_page_view(session.page_view())
    }

    /// What a page load does: make sure the session is ready, then track.
    pub async fn on_page_load<T: TabStorage + ?Sized>(
        &self,
        manager: &SessionManager<T>,
        store_id: &str,
        nav: &NavigationContext,
        page: &str,
    ) -> Option<JoinHandle<()>> {
        manager.initialize(store_id, nav).await;
        self.track_for_session(manager, page)
    }
}
