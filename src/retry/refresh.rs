//! Stream URL tracking and refresh
//!
//! Media-host URLs are short-lived. The refresher re-resolves the source
//! URL through the downloader, both reactively (before a retry) and
//! proactively (a timer that fires ahead of the projected expiry).

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::process::command::resolver_args;

/// Projected lifetime of a resolved URL when the host does not say
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(5 * 60);

/// The proactive timer fires this long before the projected expiry
pub const REFRESH_LEAD: Duration = Duration::from_secs(60);

/// Inner delays between re-resolution attempts
const REFRESH_SCHEDULE: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(5)];

/// Re-resolution attempt budget, independent of the outer retry counter
const REFRESH_ATTEMPTS: u32 = 3;

/// Backoff after a failed proactive refresh before the timer re-arms
const REFRESH_RETRY_PAUSE: Duration = Duration::from_secs(30);

/// A resolved streaming URL with its projected lifetime
#[derive(Debug, Clone)]
pub struct StreamUrl {
    pub url: String,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

impl StreamUrl {
    pub fn new(url: String) -> Self {
        Self::with_ttl(url, DEFAULT_URL_TTL)
    }

    pub fn with_ttl(url: String, ttl: Duration) -> Self {
        let acquired_at = Instant::now();
        Self {
            url,
            acquired_at,
            expires_at: acquired_at + ttl,
        }
    }

    /// When the proactive timer should fire: one minute before expiry, or
    /// right now if we are already inside that window.
    pub fn refresh_at(&self) -> Instant {
        let lead_point = self.expires_at.checked_sub(REFRESH_LEAD);
        match lead_point {
            Some(point) if point > Instant::now() => point,
            _ => Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Older than the freshness threshold, so a retry should re-resolve
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() >= threshold
    }
}

/// Resolves a source URL to a streaming URL
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve(&self, source_url: &str) -> Result<String>;
}

/// Resolver that shells out to the downloader binary
pub struct DownloaderResolver {
    binary_path: String,
    timeout: Duration,
}

impl DownloaderResolver {
    pub fn new(binary_path: &str, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl UrlResolver for DownloaderResolver {
    async fn resolve(&self, source_url: &str) -> Result<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary_path)
                .args(resolver_args(source_url))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| PipelineError::UrlResolve("url resolution timed out".to_string()))?
        .map_err(|e| PipelineError::UrlResolve(format!("resolver spawn failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::UrlResolve(format!(
                "resolver exit {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::UrlResolve("resolver produced no stream url".to_string())
            })
    }
}

/// Owns the current stream URL and its refresh discipline
///
/// Reactive refreshes run before a retry; the proactive timer keeps the URL
/// fresh during long playback. Runs never overlap: the mutex serializes
/// them and `refresh_active` makes the in-flight state observable.
pub struct UrlRefresher {
    resolver: Arc<dyn UrlResolver>,
    source_url: String,
    current: RwLock<StreamUrl>,
    refresh_lock: Mutex<()>,
    refresh_active: AtomicBool,
    /// Outcome of the most recent run, shared with callers that waited out
    /// an in-flight refresh. The error side keeps the message text only;
    /// `PipelineError` does not clone.
    last_outcome: RwLock<Option<std::result::Result<String, String>>>,
    ttl: Duration,
}

impl UrlRefresher {
    pub fn new(resolver: Arc<dyn UrlResolver>, source_url: &str, ttl: Duration) -> Self {
        Self {
            resolver,
            source_url: source_url.to_string(),
            current: RwLock::new(StreamUrl::with_ttl(source_url.to_string(), ttl)),
            refresh_lock: Mutex::new(()),
            refresh_active: AtomicBool::new(false),
            last_outcome: RwLock::new(None),
            ttl,
        }
    }

    /// The URL the next attempt should use
    pub async fn current_url(&self) -> String {
        self.current.read().await.url.clone()
    }

    /// Age of the current URL
    pub async fn current_age(&self) -> Duration {
        self.current.read().await.age()
    }

    /// Whether the current URL is older than the given threshold
    pub async fn is_stale(&self, threshold: Duration) -> bool {
        self.current.read().await.is_stale(threshold)
    }

    /// Whether a refresh is in flight right now
    pub fn refresh_in_progress(&self) -> bool {
        self.refresh_active.load(Ordering::SeqCst)
    }

    /// Re-resolve the source URL, retrying up to three times with short
    /// delays. A concurrent caller does not start a second run; it waits
    /// for the in-flight one and shares its outcome, success or failure.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<String> {
        let guard = match self.refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // A refresh is already running; wait it out and propagate
                // whatever it produced.
                let _guard = self.refresh_lock.lock().await;
                return match self.last_outcome.read().await.clone() {
                    Some(Ok(url)) => Ok(url),
                    Some(Err(message)) => Err(PipelineError::UrlResolve(message)),
                    None => Ok(self.current_url().await),
                };
            }
        };

        self.refresh_active.store(true, Ordering::SeqCst);
        let result = self.refresh_inner(cancel).await;
        *self.last_outcome.write().await = Some(match &result {
            Ok(url) => Ok(url.clone()),
            Err(e) => Err(e.to_string()),
        });
        self.refresh_active.store(false, Ordering::SeqCst);
        drop(guard);
        result
    }

    async fn refresh_inner(&self, cancel: &CancellationToken) -> Result<String> {
        let mut last_error: Option<PipelineError> = None;

        for attempt in 1..=REFRESH_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(PipelineError::UrlResolve(
                    "refresh cancelled".to_string(),
                ));
            }

            let resolved = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PipelineError::UrlResolve("refresh cancelled".to_string()));
                }
                result = self.resolver.resolve(&self.source_url) => result,
            };

            match resolved {
                Ok(url) => {
                    info!(attempt, "Stream URL refreshed");
                    *self.current.write().await = StreamUrl::with_ttl(url.clone(), self.ttl);
                    return Ok(url);
                }
                Err(e) => {
                    warn!(attempt, "URL refresh attempt failed: {}", e);
                    last_error = Some(e);
                    if attempt < REFRESH_ATTEMPTS {
                        let delay = REFRESH_SCHEDULE[(attempt as usize - 1).min(1)];
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(PipelineError::UrlResolve(
                                    "refresh cancelled".to_string(),
                                ));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(PipelineError::UrlResolve(format!(
            "refresh failed after {} attempts: {}",
            REFRESH_ATTEMPTS, last
        )))
    }

    /// Background timer that refreshes the URL ahead of its projected
    /// expiry until cancelled.
    pub fn spawn_proactive_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let refresher = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = refresher.current.read().await.refresh_at();
                let sleep_for = deadline.saturating_duration_since(Instant::now());

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }

                match refresher.refresh(&cancel).await {
                    Ok(_) => {
                        debug!("Proactive URL refresh completed");
                    }
                    Err(_) if cancel.is_cancelled() => break,
                    Err(e) => {
                        warn!("Proactive URL refresh failed: {}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(REFRESH_RETRY_PAUSE) => {}
                        }
                    }
                }

                if cancel.is_cancelled() {
                    break;
                }
            }
            debug!("Proactive refresh timer stopped");
        })
    }
}
