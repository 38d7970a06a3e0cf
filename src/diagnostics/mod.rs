//! Diagnostic and metric sinks
//!
//! The pipeline reports failures and progress through two narrow
//! capabilities: a diagnostic sink that may persist structured records and a
//! metrics sink that accepts typed samples. Neither is ever fatal to
//! playback; a sink that keeps failing is switched off.

pub mod types;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

pub use types::{DiagLevel, DiagnosticRecord, MetricSample};

use crate::error::Result;

/// Consecutive sink failures after which persistence is switched off
const SINK_FAILURE_LIMIT: u32 = 5;

/// Destination for structured diagnostic records
#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    async fn record(&self, record: DiagnosticRecord) -> Result<()>;
}

/// Destination for typed metric samples
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, sample: MetricSample);
}

/// Metrics sink that discards every sample
pub struct NullMetricsSink;

#[async_trait]
impl MetricsSink for NullMetricsSink {
    async fn record(&self, _sample: MetricSample) {}
}

/// Diagnostics front
///
/// Every record is logged through tracing; when persistence is enabled the
/// record is also forwarded to the sink. After `SINK_FAILURE_LIMIT`
/// consecutive sink failures persistence is latched off and the pipeline
/// continues without it.
pub struct Diagnostics {
    sink: Option<Arc<dyn DiagnosticSink>>,
    save_enabled: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl Diagnostics {
    pub fn new(sink: Option<Arc<dyn DiagnosticSink>>, save_to_db: bool) -> Self {
        let save_enabled = sink.is_some() && save_to_db;
        Self {
            sink,
            save_enabled: AtomicBool::new(save_enabled),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Diagnostics that only log, never persist.
    pub fn logging_only() -> Self {
        Self::new(None, false)
    }

    /// Emit one record: a tracing event always, persistence when enabled.
    pub async fn emit(&self, record: DiagnosticRecord) {
        match record.level {
            DiagLevel::Debug => debug!(
                source = %record.source,
                error = record.error.as_deref(),
                "{}", record.message
            ),
            DiagLevel::Info => info!(
                source = %record.source,
                error = record.error.as_deref(),
                "{}", record.message
            ),
            DiagLevel::Warn => warn!(
                source = %record.source,
                error = record.error.as_deref(),
                "{}", record.message
            ),
            DiagLevel::Error => error!(
                source = %record.source,
                error = record.error.as_deref(),
                "{}", record.message
            ),
        }

        if !self.save_enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(ref sink) = self.sink else { return };

        match sink.record(record).await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(failures, "Diagnostic sink rejected record: {}", e);
                if failures >= SINK_FAILURE_LIMIT {
                    error!(
                        "Diagnostic sink failed {} times in a row, disabling persistence",
                        failures
                    );
                    self.save_enabled.store(false, Ordering::Relaxed);
                }
            }
        }
    }

    /// Whether records are still being persisted
    pub fn save_enabled(&self) -> bool {
        self.save_enabled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::AtomicU32;

    struct CountingSink {
        accepted: AtomicU32,
        fail: AtomicBool,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                accepted: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl DiagnosticSink for CountingSink {
        async fn record(&self, _record: DiagnosticRecord) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                Err(PipelineError::Internal("sink down".to_string()))
            } else {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn record() -> DiagnosticRecord {
        DiagnosticRecord::new("test", DiagLevel::Info, "hello")
    }

    #[tokio::test]
    async fn test_persists_when_enabled() {
        let sink = Arc::new(CountingSink::new());
        let diagnostics = Diagnostics::new(Some(sink.clone()), true);

        diagnostics.emit(record()).await;
        assert_eq!(sink.accepted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_save_to_db_false_skips_sink() {
        let sink = Arc::new(CountingSink::new());
        let diagnostics = Diagnostics::new(Some(sink.clone()), false);

        diagnostics.emit(record()).await;
        assert_eq!(sink.accepted.load(Ordering::Relaxed), 0);
        assert!(!diagnostics.save_enabled());
    }

    #[tokio::test]
    async fn test_disables_after_consecutive_failures() {
        let sink = Arc::new(CountingSink::new());
        sink.fail.store(true, Ordering::Relaxed);
        let diagnostics = Diagnostics::new(Some(sink.clone()), true);

        for _ in 0..5 {
            diagnostics.emit(record()).await;
        }
        assert!(!diagnostics.save_enabled());

        // A recovered sink no longer receives anything
        sink.fail.store(false, Ordering::Relaxed);
        diagnostics.emit(record()).await;
        assert_eq!(sink.accepted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let sink = Arc::new(CountingSink::new());
        let diagnostics = Diagnostics::new(Some(sink.clone()), true);

        for _ in 0..4 {
            sink.fail.store(true, Ordering::Relaxed);
            diagnostics.emit(record()).await;
        }
        sink.fail.store(false, Ordering::Relaxed);
        diagnostics.emit(record()).await;
        sink.fail.store(true, Ordering::Relaxed);
        for _ in 0..4 {
            diagnostics.emit(record()).await;
        }

        // Streak was broken, persistence still on
        assert!(diagnostics.save_enabled());
    }
}
