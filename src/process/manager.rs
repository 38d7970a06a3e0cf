//! Subprocess pipeline manager
//!
//! Owns the downloader/transcoder pair for one attempt: spawns both with
//! all pipes wired, reads their stderr into bounded scrollback, supervises
//! for the first exit, and terminates the pair group-wide under a time
//! bound.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::{downloader_args, stream_mode, transcoder_args, StreamMode};
use super::scrollback::Scrollback;
use crate::classify::Classifier;
use crate::config::{DownloaderConfig, PipelineSettings, TranscoderConfig};
use crate::diagnostics::{DiagLevel, DiagnosticRecord, Diagnostics};
use crate::error::{PipelineError, Result};

/// Time allowed for task joins after the processes are gone
const JOIN_BUDGET: Duration = Duration::from_secs(2);

/// Exit record for one child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit code; `None` means the child died on a signal
    pub code: Option<i32>,
}

impl ChildExit {
    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

/// Exit records for the pair
#[derive(Debug, Clone, Copy, Default)]
pub struct PairExits {
    pub downloader: Option<ChildExit>,
    pub transcoder: Option<ChildExit>,
}

/// Observability snapshot of the helper pair
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub running: bool,
    pub mode: Option<StreamMode>,
    pub downloader_pid: Option<u32>,
    pub transcoder_pid: Option<u32>,
    pub downloader_exit: Option<i32>,
    pub transcoder_exit: Option<i32>,
    pub downloader_stderr: Vec<String>,
    pub transcoder_stderr: Vec<String>,
}

struct RunningPair {
    mode: StreamMode,
    downloader_pid: Option<u32>,
    transcoder_pid: u32,
    exited_rx: watch::Receiver<bool>,
    exits: Arc<parking_lot::Mutex<PairExits>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Subprocess pipeline manager
///
/// Invariant: the pair is all-or-nothing. In pipe mode either both
/// children are running or neither is; a lone survivor is killed by the
/// supervisor as soon as its peer exits.
pub struct ProcessManager {
    settings: PipelineSettings,
    downloader: DownloaderConfig,
    transcoder: TranscoderConfig,
    classifier: Classifier,
    diagnostics: Arc<Diagnostics>,
    inner: Mutex<Option<RunningPair>>,
    downloader_stderr: Arc<Scrollback>,
    transcoder_stderr: Arc<Scrollback>,
}

impl ProcessManager {
    pub fn new(
        settings: PipelineSettings,
        downloader: DownloaderConfig,
        transcoder: TranscoderConfig,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let classifier = Classifier::new(&downloader.binary_path, &transcoder.binary_path);
        let capacity = settings.max_stderr_lines;
        Self {
            settings,
            downloader,
            transcoder,
            classifier,
            diagnostics,
            inner: Mutex::new(None),
            downloader_stderr: Arc::new(Scrollback::new(capacity)),
            transcoder_stderr: Arc::new(Scrollback::new(capacity)),
        }
    }

    /// Start the helper pair for one attempt and return the PCM source
    /// (the transcoder's stdout).
    pub async fn start(&self, url: &str) -> Result<ChildStdout> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Err(PipelineError::Internal(
                "process pair already running".to_string(),
            ));
        }

        let mode = stream_mode(url, &self.settings.direct_url_patterns);
        self.downloader_stderr.clear();
        self.transcoder_stderr.clear();

        info!(?mode, url, "Starting helper process pair");

        // In pipe mode the downloader must exist first so its stdout can
        // become the transcoder's stdin.
        let mut downloader_child: Option<Child> = None;
        let transcoder_stdin: Stdio = match mode {
            StreamMode::Pipe => {
                let mut child = Command::new(&self.downloader.binary_path)
                    .args(downloader_args(url, &self.downloader))
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .process_group(0)
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| PipelineError::Process {
                        binary: self.downloader.binary_path.clone(),
                        reason: format!("spawn failed: {}", e),
                        exit_code: None,
                    })?;

                let stdout = child.stdout.take().ok_or_else(|| {
                    PipelineError::Internal("downloader stdout missing".to_string())
                })?;
                let stdio: Stdio = stdout.try_into().map_err(|e| {
                    PipelineError::Internal(format!("downloader stdout handoff: {}", e))
                })?;
                downloader_child = Some(child);
                stdio
            }
            StreamMode::Direct => Stdio::null(),
        };

        let transcoder_spawn = Command::new(&self.transcoder.binary_path)
            .args(transcoder_args(mode, url, &self.transcoder))
            .stdin(transcoder_stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();

        let mut transcoder_child = match transcoder_spawn {
            Ok(child) => child,
            Err(e) => {
                // The already-started peer must not outlive a failed start.
                if let Some(mut dl) = downloader_child {
                    if let Some(pid) = dl.id() {
                        signal_group(pid, Signal::SIGKILL);
                    }
                    let _ = dl.wait().await;
                }
                return Err(PipelineError::Process {
                    binary: self.transcoder.binary_path.clone(),
                    reason: format!("spawn failed: {}", e),
                    exit_code: None,
                });
            }
        };

        let pcm = transcoder_child.stdout.take().ok_or_else(|| {
            PipelineError::Internal("transcoder stdout missing".to_string())
        })?;

        let downloader_pid = downloader_child.as_ref().and_then(|c| c.id());
        let transcoder_pid = transcoder_child.id().ok_or_else(|| {
            PipelineError::Internal("transcoder exited before observation".to_string())
        })?;

        let mut tasks = Vec::new();

        if let Some(stderr) = downloader_child.as_mut().and_then(|c| c.stderr.take()) {
            tasks.push(tokio::spawn(read_stderr(
                "downloader",
                stderr,
                self.downloader_stderr.clone(),
                self.classifier.clone(),
                self.diagnostics.clone(),
            )));
        }
        if let Some(stderr) = transcoder_child.stderr.take() {
            tasks.push(tokio::spawn(read_stderr(
                "transcoder",
                stderr,
                self.transcoder_stderr.clone(),
                self.classifier.clone(),
                self.diagnostics.clone(),
            )));
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let exits = Arc::new(parking_lot::Mutex::new(PairExits::default()));

        tasks.push(tokio::spawn(supervise(
            downloader_child,
            transcoder_child,
            exits.clone(),
            exited_tx,
        )));

        debug!(
            downloader_pid = ?downloader_pid,
            transcoder_pid,
            "Helper pair started"
        );

        *inner = Some(RunningPair {
            mode,
            downloader_pid,
            transcoder_pid,
            exited_rx,
            exits,
            tasks,
        });

        Ok(pcm)
    }

    /// Graceful-then-forced stop: SIGTERM both process groups, wait up to
    /// the grace window, SIGKILL stragglers, join the tasks. A stop without
    /// a running pair is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let pair = self.inner.lock().await.take();
        let Some(mut pair) = pair else {
            return Ok(());
        };

        info!("Stopping helper process pair");

        if !*pair.exited_rx.borrow() {
            if let Some(pid) = pair.downloader_pid {
                signal_group(pid, Signal::SIGTERM);
            }
            signal_group(pair.transcoder_pid, Signal::SIGTERM);

            let grace = Duration::from_secs(self.settings.stop_grace_seconds);
            if !wait_exited(&mut pair.exited_rx, grace).await {
                warn!("Helper pair still alive after grace window, escalating to SIGKILL");
                if let Some(pid) = pair.downloader_pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                signal_group(pair.transcoder_pid, Signal::SIGKILL);
                wait_exited(&mut pair.exited_rx, JOIN_BUDGET).await;
            }
        }

        let joins = futures::future::join_all(pair.tasks);
        if tokio::time::timeout(JOIN_BUDGET, joins).await.is_err() {
            warn!("Helper tasks did not join within budget");
        }

        info!("Helper process pair stopped");
        Ok(())
    }

    /// Whether a pair is currently running
    pub async fn is_running(&self) -> bool {
        match &*self.inner.lock().await {
            Some(pair) => !*pair.exited_rx.borrow(),
            None => false,
        }
    }

    /// Wait until the pair has exited, up to `timeout`. Returns immediately
    /// when no pair is running.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let rx = {
            let inner = self.inner.lock().await;
            match &*inner {
                Some(pair) => pair.exited_rx.clone(),
                None => return true,
            }
        };
        let mut rx = rx;
        wait_exited(&mut rx, timeout).await
    }

    /// Exit records observed so far
    pub async fn exits(&self) -> PairExits {
        match &*self.inner.lock().await {
            Some(pair) => *pair.exits.lock(),
            None => PairExits::default(),
        }
    }

    /// Snapshot of the pair state. Safe to call from any task.
    pub async fn process_info(&self) -> ProcessInfo {
        let inner = self.inner.lock().await;
        let (running, mode, downloader_pid, transcoder_pid, exits) = match &*inner {
            Some(pair) => (
                !*pair.exited_rx.borrow(),
                Some(pair.mode),
                pair.downloader_pid,
                Some(pair.transcoder_pid),
                *pair.exits.lock(),
            ),
            None => (false, None, None, None, PairExits::default()),
        };
        drop(inner);

        ProcessInfo {
            running,
            mode,
            downloader_pid,
            transcoder_pid,
            downloader_exit: exits.downloader.and_then(|e| e.code),
            transcoder_exit: exits.transcoder.and_then(|e| e.code),
            downloader_stderr: self.downloader_stderr.snapshot(),
            transcoder_stderr: self.transcoder_stderr.snapshot(),
        }
    }

    /// Transcoder binary path, for error attribution
    pub fn transcoder_binary(&self) -> &str {
        &self.transcoder.binary_path
    }

    /// Downloader binary path, for error attribution
    pub fn downloader_binary(&self) -> &str {
        &self.downloader.binary_path
    }
}

async fn wait_exited(rx: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, rx.wait_for(|exited| *exited))
        .await
        .is_ok()
}

/// Send a signal to a child's process group, tolerating a group that is
/// already gone.
fn signal_group(pid: u32, signal: Signal) {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!(pid, ?signal, "Signalled process group"),
        Err(nix::errno::Errno::ESRCH) => debug!(pid, "Process group already gone"),
        Err(e) => warn!(pid, ?signal, "Failed to signal process group: {}", e),
    }
}

/// Wait for the first child to exit, kill the peer's group, reap it, and
/// announce that the pair is gone.
async fn supervise(
    downloader: Option<Child>,
    transcoder: Child,
    exits: Arc<parking_lot::Mutex<PairExits>>,
    exited_tx: watch::Sender<bool>,
) {
    let mut transcoder = transcoder;

    match downloader {
        Some(mut downloader) => {
            tokio::select! {
                status = downloader.wait() => {
                    let exit = to_child_exit(&status);
                    warn!(code = ?exit.code, "Downloader exited first, killing transcoder group");
                    exits.lock().downloader = Some(exit);

                    if let Some(pid) = transcoder.id() {
                        signal_group(pid, Signal::SIGKILL);
                    }
                    let status = transcoder.wait().await;
                    exits.lock().transcoder = Some(to_child_exit(&status));
                }
                status = transcoder.wait() => {
                    let exit = to_child_exit(&status);
                    warn!(code = ?exit.code, "Transcoder exited first, killing downloader group");
                    exits.lock().transcoder = Some(exit);

                    if let Some(pid) = downloader.id() {
                        signal_group(pid, Signal::SIGKILL);
                    }
                    let status = downloader.wait().await;
                    exits.lock().downloader = Some(to_child_exit(&status));
                }
            }
        }
        None => {
            let status = transcoder.wait().await;
            exits.lock().transcoder = Some(to_child_exit(&status));
        }
    }

    let _ = exited_tx.send(true);
    debug!("Helper pair exited");
}

fn to_child_exit(status: &std::io::Result<std::process::ExitStatus>) -> ChildExit {
    match status {
        Ok(status) => ChildExit {
            code: status.code(),
        },
        Err(_) => ChildExit { code: None },
    }
}

/// Scan one child's stderr line by line into the scrollback, tagging lines
/// that match the error-pattern sets. Exits on EOF or a terminal read
/// error.
async fn read_stderr(
    name: &'static str,
    stream: ChildStderr,
    ring: Arc<Scrollback>,
    classifier: Classifier,
    diagnostics: Arc<Diagnostics>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("[{}] {}", name, line);
                let tag = classifier.tag_stderr_line(&line);
                ring.append(line.clone());

                let level = if tag.is_some() {
                    DiagLevel::Warn
                } else {
                    DiagLevel::Debug
                };
                let mut record = DiagnosticRecord::new(name, level, line);
                if let Some(kind) = tag {
                    record = record.with_field("kind", kind.as_str());
                }
                diagnostics.emit(record).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!("[{}] stderr read error: {}", name, e);
                break;
            }
        }
    }
}
