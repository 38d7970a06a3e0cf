//! Pipeline controller
//!
//! The single public entry for playback: validates and prepares components
//! at initialization, drives the frame loop for one session at a time, and
//! routes failures through the retry engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::ChildStdout;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::session::{PipelineSession, PipelineState, PipelineStatus};
use crate::audio::{FrameAssembler, OpusConfig, OpusEncoder, FRAME_DURATION};
use crate::classify::Classifier;
use crate::config::PipelineConfig;
use crate::diagnostics::{DiagLevel, DiagnosticRecord, Diagnostics, MetricSample, MetricsSink};
use crate::error::{PipelineError, Result};
use crate::process::{validate_binaries, validate_source_url, ProcessManager};
use crate::retry::{
    DownloaderResolver, RetryConfig, RetryEngine, RetryStep, UrlRefresher, UrlResolver,
    DEFAULT_URL_TTL,
};
use crate::sink::{SendOutcome, VoiceSink};
use crate::utils::LogThrottler;

/// Pause before the first read, giving the transcoder time to produce bytes
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// Budget for joining the frame loop and timer tasks on stop
const TASK_JOIN_BUDGET: Duration = Duration::from_secs(2);

#[derive(Default)]
struct ControllerStats {
    frames_read: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
    errors: AtomicU64,
}

struct ActivePlayback {
    cancel: CancellationToken,
    loop_task: JoinHandle<()>,
    refresh_timer: JoinHandle<()>,
}

/// Pipeline controller
///
/// Owns the subprocess manager, the Opus encoder, and at most one play
/// session. All public operations are safe to call from any task.
pub struct PipelineController {
    config: PipelineConfig,
    diagnostics: Arc<Diagnostics>,
    metrics: Arc<dyn MetricsSink>,
    resolver: Arc<dyn UrlResolver>,
    manager: Arc<ProcessManager>,
    encoder: Arc<Mutex<OpusEncoder>>,
    initialized: AtomicBool,
    state_tx: watch::Sender<PipelineState>,
    state_rx: watch::Receiver<PipelineState>,
    session: Arc<RwLock<Option<PipelineSession>>>,
    last_error: Arc<RwLock<Option<String>>>,
    stats: Arc<ControllerStats>,
    active: Mutex<Option<ActivePlayback>>,
}

impl PipelineController {
    /// Create a controller over the given configuration and sinks. The
    /// audio parameters are clamped to the voice contract up front; the
    /// rest of the configuration is validated by `initialize`.
    pub fn new(
        mut config: PipelineConfig,
        diagnostics: Arc<Diagnostics>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        config.enforce_voice_contract();

        let resolver: Arc<dyn UrlResolver> = Arc::new(DownloaderResolver::new(
            &config.downloader.binary_path,
            Duration::from_secs(config.pipeline.timeout_seconds.max(10)),
        ));
        Self::with_resolver(config, diagnostics, metrics, resolver)
    }

    /// Like `new`, with an explicit URL resolver.
    pub fn with_resolver(
        mut config: PipelineConfig,
        diagnostics: Arc<Diagnostics>,
        metrics: Arc<dyn MetricsSink>,
        resolver: Arc<dyn UrlResolver>,
    ) -> Self {
        config.enforce_voice_contract();

        let manager = Arc::new(ProcessManager::new(
            config.pipeline.clone(),
            config.downloader.clone(),
            config.transcoder.clone(),
            diagnostics.clone(),
        ));
        let encoder = Arc::new(Mutex::new(OpusEncoder::new(OpusConfig {
            bitrate: config.opus.bitrate,
            frame_size: config.opus.frame_size,
            vbr: true,
        })));
        let (state_tx, state_rx) = watch::channel(PipelineState::Stopped);

        Self {
            config,
            diagnostics,
            metrics,
            resolver,
            manager,
            encoder,
            initialized: AtomicBool::new(false),
            state_tx,
            state_rx,
            session: Arc::new(RwLock::new(None)),
            last_error: Arc::new(RwLock::new(None)),
            stats: Arc::new(ControllerStats::default()),
            active: Mutex::new(None),
        }
    }

    /// Validate configuration and helper binaries, prepare the encoder.
    /// Idempotent: a second call on an initialized controller is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.config.validate()?;
        validate_binaries(
            &self.config.downloader,
            &self.config.transcoder,
            &self.config.pipeline,
        )
        .await?;

        {
            let mut encoder = self.encoder.lock().await;
            if !encoder.is_initialized() {
                encoder.initialize()?;
            }
            encoder.prepare_for_streaming()?;
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("Pipeline controller initialized");
        Ok(())
    }

    /// Current session state
    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    /// Start playing `source_url` into `sink`.
    ///
    /// Returns once the helper pair has started; the frame loop then runs
    /// on its own task. A second play while a session is active fails fast
    /// without side effects.
    pub async fn play(&self, source_url: &str, sink: VoiceSink) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(PipelineError::Config(
                "invalid config: controller not initialized".to_string(),
            ));
        }
        validate_source_url(source_url)?;

        let mut active = self.active.lock().await;
        self.reap_finished(&mut active).await;
        if active.is_some() {
            return Err(PipelineError::Internal(
                "a play session is already active".to_string(),
            ));
        }

        let session = PipelineSession::new(source_url);
        let session_id = session.id;
        info!(session = %session_id, url = source_url, "Starting playback");

        *self.session.write().await = Some(session);
        *self.last_error.write().await = None;
        self.reset_stats();
        transition(&self.state_tx, PipelineState::Starting);

        let cancel = CancellationToken::new();
        let refresher = Arc::new(UrlRefresher::new(
            self.resolver.clone(),
            source_url,
            DEFAULT_URL_TTL,
        ));

        let retry_config = RetryConfig::from_settings(&self.config.retry)?;
        let engine = RetryEngine::new(
            retry_config,
            Classifier::new(
                &self.config.downloader.binary_path,
                &self.config.transcoder.binary_path,
            ),
            refresher.clone(),
            self.diagnostics.clone(),
            self.metrics.clone(),
            session_id,
        );

        let pcm = match self.manager.start(source_url).await {
            Ok(pcm) => pcm,
            Err(e) => {
                *self.last_error.write().await = Some(e.to_string());
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                *self.session.write().await = None;
                transition(&self.state_tx, PipelineState::Stopped);
                self.diagnostics
                    .emit(
                        DiagnosticRecord::new("controller", DiagLevel::Error, "playback start failed")
                            .with_error(&e)
                            .with_session(session_id),
                    )
                    .await;
                return Err(e);
            }
        };

        let refresh_timer = refresher.spawn_proactive_timer(cancel.clone());

        let ctx = FrameLoopCtx {
            manager: self.manager.clone(),
            encoder: self.encoder.clone(),
            engine,
            sink,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            stats: self.stats.clone(),
            state_tx: self.state_tx.clone(),
            session: self.session.clone(),
            last_error: self.last_error.clone(),
            cancel: cancel.clone(),
            read_timeout: Duration::from_secs(self.config.pipeline.timeout_seconds),
            throttler: LogThrottler::with_secs(5),
        };
        let loop_task = tokio::spawn(frame_loop(ctx, pcm));

        *active = Some(ActivePlayback {
            cancel,
            loop_task,
            refresh_timer,
        });

        Ok(())
    }

    /// Stop any active playback. Component shutdown errors are logged, not
    /// surfaced. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(playback) = active.take() {
            info!("Stopping playback");
            playback.cancel.cancel();
            join_task(playback.loop_task, "frame loop").await;
            join_task(playback.refresh_timer, "refresh timer").await;
        }

        if let Err(e) = self.manager.stop().await {
            warn!("Subprocess stop failed: {}", e);
        }

        {
            let mut encoder = self.encoder.lock().await;
            if let Err(e) = encoder.end_session() {
                warn!("Encoder session close failed: {}", e);
            }
        }

        *self.session.write().await = None;
        transition(&self.state_tx, PipelineState::Stopped);
        Ok(())
    }

    /// Stop playback and release every component. The controller must be
    /// initialized again before the next play. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();

        {
            let mut active = self.active.lock().await;
            if let Some(playback) = active.take() {
                playback.cancel.cancel();
                join_task(playback.loop_task, "frame loop").await;
                join_task(playback.refresh_timer, "refresh timer").await;
            }
        }

        if let Err(e) = self.manager.stop().await {
            failures.push(format!("subprocess manager: {}", e));
        }

        self.encoder.lock().await.close();
        *self.session.write().await = None;
        transition(&self.state_tx, PipelineState::Stopped);
        self.initialized.store(false, Ordering::SeqCst);

        info!("Pipeline controller shut down");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Internal(format!(
                "shutdown completed with errors: {}",
                failures.join("; ")
            )))
        }
    }

    /// Point-in-time status snapshot. Never fails.
    pub async fn status(&self) -> PipelineStatus {
        let state = self.state();
        let session = self.session.read().await.clone();

        PipelineStatus {
            state,
            playing: state == PipelineState::Playing,
            source_url: session.as_ref().map(|s| s.source_url.clone()),
            started_at: session.as_ref().map(|s| s.started_at_utc),
            error_count: self.stats.errors.load(Ordering::Relaxed),
            last_error: self.last_error.read().await.clone(),
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.stats.packets_dropped.load(Ordering::Relaxed),
            process: self.manager.process_info().await,
        }
    }

    fn reset_stats(&self) {
        self.stats.frames_read.store(0, Ordering::Relaxed);
        self.stats.packets_sent.store(0, Ordering::Relaxed);
        self.stats.packets_dropped.store(0, Ordering::Relaxed);
    }

    /// Clear out a playback whose frame loop already finished on its own.
    async fn reap_finished(&self, active: &mut Option<ActivePlayback>) {
        let finished = matches!(active, Some(playback) if playback.loop_task.is_finished());
        if finished {
            if let Some(playback) = active.take() {
                playback.cancel.cancel();
                join_task(playback.loop_task, "frame loop").await;
                join_task(playback.refresh_timer, "refresh timer").await;
            }
        }
    }
}

async fn join_task(task: JoinHandle<()>, name: &str) {
    if tokio::time::timeout(TASK_JOIN_BUDGET, task).await.is_err() {
        warn!("{} did not join within budget", name);
    }
}

/// Advance the session state machine. Re-sending the current state is an
/// idempotent no-op; an edge the state machine does not allow is refused
/// and logged instead of applied.
fn transition(state_tx: &watch::Sender<PipelineState>, next: PipelineState) {
    let current = *state_tx.borrow();
    if current == next {
        return;
    }
    if !current.can_transition(next) {
        error!(%current, %next, "Illegal session state transition refused");
        return;
    }
    let _ = state_tx.send(next);
}

struct FrameLoopCtx {
    manager: Arc<ProcessManager>,
    encoder: Arc<Mutex<OpusEncoder>>,
    engine: RetryEngine,
    sink: VoiceSink,
    diagnostics: Arc<Diagnostics>,
    metrics: Arc<dyn MetricsSink>,
    stats: Arc<ControllerStats>,
    state_tx: watch::Sender<PipelineState>,
    session: Arc<RwLock<Option<PipelineSession>>>,
    last_error: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
    read_timeout: Duration,
    throttler: LogThrottler,
}

enum LoopEnd {
    CleanEof,
    Stopped,
    Failed(PipelineError),
}

/// The frame loop: read exact PCM frames, encode, deliver, and route every
/// failure through the retry engine. Runs on its own task per session.
async fn frame_loop(ctx: FrameLoopCtx, pcm: ChildStdout) {
    let end = drive_session(&ctx, pcm).await;

    match &end {
        LoopEnd::CleanEof => {
            let frames = ctx.stats.frames_read.load(Ordering::Relaxed);
            let playback = FRAME_DURATION * frames as u32;
            info!(
                frames,
                playback_ms = playback.as_millis() as u64,
                "Playback finished"
            );
            ctx.metrics
                .record(MetricSample::PlaybackDuration(playback))
                .await;
        }
        LoopEnd::Stopped => debug!("Frame loop stopped on request"),
        LoopEnd::Failed(e) => {
            error!("Playback failed: {}", e);
            *ctx.last_error.write().await = Some(e.to_string());
        }
    }

    if let Err(e) = ctx.manager.stop().await {
        warn!("Subprocess stop after frame loop failed: {}", e);
    }
    if let Err(e) = ctx.encoder.lock().await.end_session() {
        warn!("Encoder session close failed: {}", e);
    }

    // Also stops the proactive refresh timer.
    ctx.cancel.cancel();
    transition(&ctx.state_tx, PipelineState::Stopped);
}

async fn drive_session(ctx: &FrameLoopCtx, pcm: ChildStdout) -> LoopEnd {
    let mut assembler = FrameAssembler::new(pcm);
    let mut awaiting_first_frame = true;
    let mut startup_recorded = false;
    let mut pending: Option<(PipelineError, &'static str)> = None;

    if !grace_sleep(&ctx.cancel).await {
        return LoopEnd::Stopped;
    }

    loop {
        // A failure from the previous iteration goes through the retry
        // engine before anything else.
        if let Some((error, context)) = pending.take() {
            ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
            *ctx.last_error.write().await = Some(error.to_string());
            transition(&ctx.state_tx, PipelineState::Error);

            if let Err(e) = ctx.manager.stop().await {
                warn!("Subprocess stop before retry failed: {}", e);
            }

            let attempt = {
                let mut session = ctx.session.write().await;
                match session.as_mut() {
                    Some(session) => {
                        session.attempt += 1;
                        session.last_error = Some(error.to_string());
                        session.attempt
                    }
                    None => return LoopEnd::Stopped,
                }
            };

            match ctx.engine.next_step(attempt, error, context, &ctx.cancel).await {
                RetryStep::Continue { url, kind } => {
                    debug!(attempt, %kind, "Restarting pipeline after retry delay");
                    transition(&ctx.state_tx, PipelineState::Starting);
                    awaiting_first_frame = true;

                    match ctx.manager.start(&url).await {
                        Ok(pcm) => {
                            assembler = FrameAssembler::new(pcm);
                            if !grace_sleep(&ctx.cancel).await {
                                return LoopEnd::Stopped;
                            }
                        }
                        Err(e) => {
                            pending = Some((e, "start"));
                        }
                    }
                    continue;
                }
                RetryStep::Abort { error, .. } => return LoopEnd::Failed(error),
                RetryStep::Cancelled => return LoopEnd::Stopped,
            }
        }

        // One frame: read, encode, deliver. Cancellation is honored at
        // every await.
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => return LoopEnd::Stopped,
            read = tokio::time::timeout(ctx.read_timeout, assembler.next_frame()) => {
                match read {
                    Err(_) => {
                        pending = Some((
                            PipelineError::Stream("pipeline timeout waiting for pcm".to_string()),
                            "stream_read",
                        ));
                        continue;
                    }
                    Ok(Err(e)) => {
                        pending = Some((e, "stream_read"));
                        continue;
                    }
                    Ok(Ok(None)) => match classify_eof(ctx).await {
                        None => return LoopEnd::CleanEof,
                        Some(e) => {
                            pending = Some((e, "stream_read"));
                            continue;
                        }
                    },
                    Ok(Ok(Some(frame))) => frame,
                }
            }
        };

        if awaiting_first_frame {
            awaiting_first_frame = false;
            transition(&ctx.state_tx, PipelineState::Playing);

            if !startup_recorded {
                startup_recorded = true;
                let startup = ctx
                    .session
                    .read()
                    .await
                    .as_ref()
                    .map(|s| s.started_at.elapsed())
                    .unwrap_or_default();
                ctx.metrics
                    .record(MetricSample::StartupTime(startup))
                    .await;
                debug!(startup_ms = startup.as_millis() as u64, "First frame delivered");
            }
        }
        ctx.stats.frames_read.fetch_add(1, Ordering::Relaxed);

        let encoded = ctx.encoder.lock().await.encode(&frame);
        let packet = match encoded {
            Ok(packet) => packet,
            Err(e) => {
                pending = Some((e, "encoding"));
                continue;
            }
        };

        match ctx.sink.try_send(packet.data) {
            Ok(SendOutcome::Sent) => {
                ctx.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(SendOutcome::Dropped) => {
                ctx.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                if ctx.throttler.should_log("voice_sink_full") {
                    warn!(
                        dropped = ctx.stats.packets_dropped.load(Ordering::Relaxed),
                        "Voice sink full, dropping frame"
                    );
                }
            }
            Err(e) => {
                pending = Some((e, "voice_sink"));
            }
        }
    }
}

/// End-of-stream is only clean when the transcoder finished voluntarily
/// with a zero status; anything else feeds the retry engine.
async fn classify_eof(ctx: &FrameLoopCtx) -> Option<PipelineError> {
    ctx.manager.wait_exited(TASK_JOIN_BUDGET).await;
    let exits = ctx.manager.exits().await;

    match exits.transcoder {
        Some(exit) if exit.success() => None,
        Some(exit) => Some(PipelineError::process_exit(
            ctx.manager.transcoder_binary(),
            exit.code,
        )),
        None => Some(PipelineError::Stream(
            "pcm stream closed before the transcoder exited".to_string(),
        )),
    }
}

/// Cancellable startup grace. Returns false when stopped mid-sleep.
async fn grace_sleep(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(STARTUP_GRACE) => true,
    }
}
