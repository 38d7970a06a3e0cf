//! Retry, backoff, and stream URL refresh
//!
//! This module provides:
//! - The two delay schedule families (streaming and exponential)
//! - Stream URL lifetime tracking with reactive and proactive refresh
//! - The retry state machine the controller consults on every failure

pub mod engine;
pub mod policy;
pub mod refresh;

pub use engine::{RetryEngine, RetryStep};
pub use policy::{streaming_delay, RetryConfig, RetryDecision, STREAMING_SCHEDULE};
pub use refresh::{
    DownloaderResolver, StreamUrl, UrlRefresher, UrlResolver, DEFAULT_URL_TTL, REFRESH_LEAD,
};
