//! Retry state machine
//!
//! Given a failure from the frame loop, decides whether to retry (and after
//! how long, and whether to re-resolve the URL first) or to give up. Emits
//! one retry notice per attempt and a single exhaustion notice.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::policy::{RetryConfig, RetryDecision};
use super::refresh::UrlRefresher;
use crate::classify::{Classifier, ErrorKind};
use crate::diagnostics::{DiagLevel, DiagnosticRecord, Diagnostics, MetricSample, MetricsSink};
use crate::error::PipelineError;

/// What the controller should do next
#[derive(Debug)]
pub enum RetryStep {
    /// Delay has elapsed; restart the pipeline with this URL
    Continue { url: String, kind: ErrorKind },
    /// Give up with this final error
    Abort {
        error: PipelineError,
        kind: ErrorKind,
        exhausted: bool,
    },
    /// The session was stopped while the engine was waiting
    Cancelled,
}

/// Retry and URL-refresh engine
pub struct RetryEngine {
    config: RetryConfig,
    classifier: Classifier,
    refresher: Arc<UrlRefresher>,
    diagnostics: Arc<Diagnostics>,
    metrics: Arc<dyn MetricsSink>,
    session_id: Uuid,
}

impl RetryEngine {
    pub fn new(
        config: RetryConfig,
        classifier: Classifier,
        refresher: Arc<UrlRefresher>,
        diagnostics: Arc<Diagnostics>,
        metrics: Arc<dyn MetricsSink>,
        session_id: Uuid,
    ) -> Self {
        Self {
            config,
            classifier,
            refresher,
            diagnostics,
            metrics,
            session_id,
        }
    }

    pub fn refresher(&self) -> &Arc<UrlRefresher> {
        &self.refresher
    }

    /// Pure decision: classify, check the budget, pick the schedule.
    /// `url_stale` reports whether the current stream URL is past the
    /// freshness threshold.
    pub fn decide(&self, attempt: u32, error: &PipelineError, url_stale: bool) -> RetryDecision {
        let classification = self.classifier.classify(error);

        if !classification.retryable {
            return RetryDecision::Abort {
                kind: classification.kind,
                exhausted: false,
            };
        }
        if attempt > self.config.max_attempts {
            return RetryDecision::Abort {
                kind: classification.kind,
                exhausted: true,
            };
        }

        RetryDecision::Retry {
            kind: classification.kind,
            delay: self.config.delay_for(classification.kind, attempt),
            refresh_url: classification.kind.triggers_url_refresh() || url_stale,
        }
    }

    /// Run one full retry step: decide, notify, refresh if needed, wait out
    /// the delay. Every wait is cancellable by the session's stop signal.
    pub async fn next_step(
        &self,
        attempt: u32,
        error: PipelineError,
        context: &str,
        cancel: &CancellationToken,
    ) -> RetryStep {
        let url_stale = self.refresher.is_stale(self.config.url_freshness).await;
        let decision = self.decide(attempt, &error, url_stale);

        match decision {
            RetryDecision::Abort { kind, exhausted } => {
                self.metrics.record(MetricSample::ErrorKindTick(kind)).await;

                if exhausted {
                    let wrapped = PipelineError::exhausted(attempt, error);
                    self.diagnostics
                        .emit(
                            DiagnosticRecord::new(
                                "retry_engine",
                                DiagLevel::Error,
                                format!("retries exhausted after {} attempts", attempt),
                            )
                            .with_error(&wrapped)
                            .with_field("kind", kind.as_str())
                            .with_field("context", context)
                            .with_session(self.session_id),
                        )
                        .await;
                    RetryStep::Abort {
                        error: wrapped,
                        kind,
                        exhausted: true,
                    }
                } else {
                    self.diagnostics
                        .emit(
                            DiagnosticRecord::new(
                                "retry_engine",
                                DiagLevel::Error,
                                kind.user_message(),
                            )
                            .with_error(&error)
                            .with_field("kind", kind.as_str())
                            .with_field("context", context)
                            .with_session(self.session_id),
                        )
                        .await;
                    RetryStep::Abort {
                        error,
                        kind,
                        exhausted: false,
                    }
                }
            }
            RetryDecision::Retry {
                kind,
                delay,
                refresh_url,
            } => {
                self.metrics.record(MetricSample::ErrorKindTick(kind)).await;
                self.diagnostics
                    .emit(
                        DiagnosticRecord::new(
                            "retry_engine",
                            DiagLevel::Warn,
                            format!(
                                "retrying playback (attempt {}, next delay {}s)",
                                attempt,
                                delay.as_secs()
                            ),
                        )
                        .with_error(&error)
                        .with_field("kind", kind.as_str())
                        .with_field("context", context)
                        .with_field("attempt", attempt.to_string())
                        .with_field("delay_ms", delay.as_millis().to_string())
                        .with_session(self.session_id),
                    )
                    .await;

                if refresh_url {
                    // Refresh failures are logged and counted on their own;
                    // the retry proceeds with the previous URL.
                    if let Err(e) = self.refresher.refresh(cancel).await {
                        if cancel.is_cancelled() {
                            return RetryStep::Cancelled;
                        }
                        warn!("URL refresh before retry failed: {}", e);
                        self.diagnostics
                            .emit(
                                DiagnosticRecord::new(
                                    "retry_engine",
                                    DiagLevel::Warn,
                                    "url refresh before retry failed",
                                )
                                .with_error(&e)
                                .with_field("context", context)
                                .with_session(self.session_id),
                            )
                            .await;
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => RetryStep::Cancelled,
                    _ = tokio::time::sleep(delay) => RetryStep::Continue {
                        url: self.refresher.current_url().await,
                        kind,
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullMetricsSink;
    use crate::retry::refresh::{UrlResolver, DEFAULT_URL_TTL};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FakeResolver {
        calls: AtomicU32,
    }

    #[async_trait]
    impl UrlResolver for FakeResolver {
        async fn resolve(&self, _source_url: &str) -> crate::error::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("https://cdn.example/fresh".to_string())
        }
    }

    fn engine(max_attempts: u32) -> (RetryEngine, Arc<FakeResolver>) {
        let resolver = Arc::new(FakeResolver {
            calls: AtomicU32::new(0),
        });
        let refresher = Arc::new(UrlRefresher::new(
            resolver.clone(),
            "https://video.example/v",
            DEFAULT_URL_TTL,
        ));
        let engine = RetryEngine::new(
            RetryConfig {
                max_attempts,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                url_freshness: Duration::from_secs(240),
            },
            Classifier::new("yt-dlp", "ffmpeg"),
            refresher,
            Arc::new(Diagnostics::logging_only()),
            Arc::new(NullMetricsSink),
            Uuid::new_v4(),
        );
        (engine, resolver)
    }

    #[test]
    fn test_decide_non_retryable_aborts() {
        let (engine, _) = engine(3);
        let decision = engine.decide(1, &PipelineError::Config("invalid config: x".into()), false);
        assert_eq!(
            decision,
            RetryDecision::Abort {
                kind: ErrorKind::Configuration,
                exhausted: false
            }
        );
    }

    #[test]
    fn test_decide_exhaustion() {
        let (engine, _) = engine(2);
        let error = PipelineError::Stream("pipe broken".into());

        assert!(matches!(
            engine.decide(1, &error, false),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            engine.decide(2, &error, false),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(
            engine.decide(3, &error, false),
            RetryDecision::Abort {
                kind: ErrorKind::StreamingPipeline,
                exhausted: true
            }
        );
    }

    #[test]
    fn test_decide_streaming_schedule() {
        let (engine, _) = engine(5);
        let error = PipelineError::process_exit("ffmpeg", Some(1));

        for (attempt, expected) in [(1u32, 2u64), (2, 5), (3, 10), (4, 10)] {
            match engine.decide(attempt, &error, false) {
                RetryDecision::Retry { delay, kind, .. } => {
                    assert_eq!(kind, ErrorKind::TranscoderTransient);
                    assert_eq!(delay, Duration::from_secs(expected));
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_decide_exponential_schedule() {
        let (engine, _) = engine(10);
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let error: PipelineError = io.into();

        for (attempt, expected) in [(1u32, 1u64), (2, 2), (3, 4), (4, 8)] {
            match engine.decide(attempt, &error, false) {
                RetryDecision::Retry { delay, kind, .. } => {
                    assert_eq!(kind, ErrorKind::NetworkTransient);
                    assert_eq!(delay, Duration::from_secs(expected));
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_url_expiry_requests_refresh() {
        let (engine, _) = engine(3);
        let error = PipelineError::UrlResolve("HTTP error 403 Forbidden".into());
        match engine.decide(1, &error, false) {
            RetryDecision::Retry { refresh_url, .. } => assert!(refresh_url),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_url_requests_refresh() {
        let (engine, _) = engine(3);
        let error = PipelineError::Stream("stream interrupted".into());
        match engine.decide(1, &error, true) {
            RetryDecision::Retry { refresh_url, .. } => assert!(refresh_url),
            other => panic!("expected retry, got {:?}", other),
        }
        match engine.decide(1, &error, false) {
            RetryDecision::Retry { refresh_url, .. } => assert!(!refresh_url),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_step_refreshes_on_url_expiry() {
        let (engine, resolver) = engine(3);
        let cancel = CancellationToken::new();

        let step = engine
            .next_step(
                1,
                PipelineError::UrlResolve("url expired".into()),
                "stream_read",
                &cancel,
            )
            .await;

        match step {
            RetryStep::Continue { url, kind } => {
                assert_eq!(url, "https://cdn.example/fresh");
                assert_eq!(kind, ErrorKind::UrlExpiry);
            }
            other => panic!("expected continue, got {:?}", other),
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_step_exhausted_wraps_error() {
        let (engine, _) = engine(2);
        let cancel = CancellationToken::new();

        let step = engine
            .next_step(
                3,
                PipelineError::process_exit("ffmpeg", Some(1)),
                "stream_read",
                &cancel,
            )
            .await;

        match step {
            RetryStep::Abort { error, exhausted, .. } => {
                assert!(exhausted);
                assert!(error.to_string().contains("after 3 attempts"));
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_next_step_cancelled_during_delay() {
        let (engine, _) = engine(3);
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let step = engine
            .next_step(
                1,
                PipelineError::Stream("pipe broken".into()),
                "stream_read",
                &cancel,
            )
            .await;

        assert!(matches!(step, RetryStep::Cancelled));
        // Returned well before the 2s streaming delay
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
