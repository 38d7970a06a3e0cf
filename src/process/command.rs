//! Helper binary invocation contracts
//!
//! Argument construction for the downloader and transcoder, stream mode
//! selection, source URL validation, and startup binary probing.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{DownloaderConfig, PipelineSettings, TranscoderConfig};
use crate::error::{PipelineError, Result};

/// How the helper pair is wired for a given URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Downloader writes media to stdout, transcoder reads from stdin
    Pipe,
    /// Transcoder reads the URL itself; no downloader process
    Direct,
}

/// Playlist/manifest extensions that always stream directly
const DIRECT_EXTENSIONS: &[&str] = &[".m3u8", ".mpd"];

/// Select the mode for a URL. Pure over the URL text: playlist extensions
/// and the configured patterns choose direct mode, everything else pipes.
pub fn stream_mode(url: &str, direct_patterns: &[String]) -> StreamMode {
    let lowered = url.to_lowercase();
    let path_end = lowered.find('?').unwrap_or(lowered.len());
    let path = &lowered[..path_end];

    if DIRECT_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return StreamMode::Direct;
    }
    if direct_patterns
        .iter()
        .any(|p| !p.is_empty() && lowered.contains(&p.to_lowercase()))
    {
        return StreamMode::Direct;
    }
    StreamMode::Pipe
}

/// Validate a play request URL before any process is spawned.
pub fn validate_source_url(url: &str) -> Result<()> {
    if url.trim().is_empty() {
        return Err(PipelineError::Config(
            "invalid config: source url must not be empty".to_string(),
        ));
    }
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            PipelineError::Config(format!(
                "invalid config: source url must be http(s), got {:?}",
                url
            ))
        })?;
    let host = rest.split(['/', '?']).next().unwrap_or("");
    if host.is_empty() {
        return Err(PipelineError::Config(
            "invalid config: source url has no host".to_string(),
        ));
    }
    Ok(())
}

/// Pipe-mode downloader invocation: best audio to stdout, quiet.
pub fn downloader_args(url: &str, config: &DownloaderConfig) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "-".to_string(),
        "--quiet".to_string(),
        "--no-warnings".to_string(),
        "--format".to_string(),
        "bestaudio/best".to_string(),
        "--no-playlist".to_string(),
    ];
    args.extend(config.extra_args.iter().cloned());
    args.push(url.to_string());
    args
}

/// URL resolution invocation: print the resolved streaming URL only.
pub fn resolver_args(url: &str) -> Vec<String> {
    vec![
        "--get-url".to_string(),
        "--format".to_string(),
        "bestaudio/best".to_string(),
        "--no-playlist".to_string(),
        "--quiet".to_string(),
        url.to_string(),
    ]
}

/// Transcoder invocation for either mode: raw PCM on stdout per the
/// configured format, timestamps normalized, logs reduced to errors.
pub fn transcoder_args(mode: StreamMode, url: &str, config: &TranscoderConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    match mode {
        StreamMode::Pipe => {
            args.extend(["-i".to_string(), "pipe:0".to_string()]);
        }
        StreamMode::Direct => {
            // Reconnect and probe options are input options and must
            // precede -i.
            args.extend(
                [
                    "-reconnect",
                    "1",
                    "-reconnect_delay_max",
                    "5",
                    "-reconnect_streamed",
                    "1",
                    "-reconnect_at_eof",
                    "1",
                    "-probesize",
                    "10M",
                    "-analyzeduration",
                    "10M",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
            args.extend(["-i".to_string(), url.to_string()]);
        }
    }

    args.extend([
        "-f".to_string(),
        config.audio_format.clone(),
        "-ar".to_string(),
        config.sample_rate.to_string(),
        "-ac".to_string(),
        config.channels.to_string(),
        "-avoid_negative_ts".to_string(),
        "make_zero".to_string(),
        "-fflags".to_string(),
        "+genpts".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]);

    args
}

/// Probe both helper binaries at initialization. A missing or broken
/// binary is a configuration error that prevents `play`.
pub async fn validate_binaries(
    downloader: &DownloaderConfig,
    transcoder: &TranscoderConfig,
    settings: &PipelineSettings,
) -> Result<()> {
    let timeout = Duration::from_secs(settings.timeout_seconds);

    let output = probe_binary(&downloader.binary_path, "--version", timeout).await?;
    debug!(binary = %downloader.binary_path, "Downloader version: {}", output.lines().next().unwrap_or(""));

    let output = probe_binary(&transcoder.binary_path, "-version", timeout).await?;
    if !output.contains("ffmpeg version") {
        return Err(PipelineError::Config(format!(
            "missing binary: {} did not report an ffmpeg version",
            transcoder.binary_path
        )));
    }
    debug!(binary = %transcoder.binary_path, "Transcoder version: {}", output.lines().next().unwrap_or(""));

    info!("Helper binaries validated");
    Ok(())
}

async fn probe_binary(path: &str, version_flag: &str, timeout: Duration) -> Result<String> {
    let result = tokio::time::timeout(
        timeout,
        Command::new(path)
            .arg(version_flag)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(PipelineError::Config(format!(
                "missing binary: {} ({})",
                path, e
            )))
        }
        Err(_) => {
            return Err(PipelineError::Config(format!(
                "missing binary: {} version probe timed out",
                path
            )))
        }
    };

    let text = String::from_utf8_lossy(&output.stdout).to_string();
    if text.trim().is_empty() {
        return Err(PipelineError::Config(format!(
            "missing binary: {} produced no version output",
            path
        )));
    }
    Ok(text)
}
