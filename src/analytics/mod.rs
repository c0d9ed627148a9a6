//! Visitor-side analytics: the per-tab session with first-touch attribution,
//! and the page-view tracker that reports to the tracking ingress.

pub mod session;
pub mod tracker;

pub use session::{
    AnalyticsSession, MemoryTabStorage, NavigationContext, SessionManager, SessionState,
    TabStorage,
};
pub use tracker::{ChannelSink, HttpSink, PageViewTracker, TrackError, TrackingSink};
