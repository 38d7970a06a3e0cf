//! Error classification for retry policy
//!
//! Maps pipeline errors onto a closed set of kinds that drive the retry
//! schedule, URL refresh, and outgoing diagnostic tags. Typed variants are
//! inspected first; text matching is the fallback for errors that arrive as
//! plain I/O or child stderr output.

use std::io::ErrorKind as IoKind;

use crate::error::PipelineError;

/// Closed set of failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTransient,
    ProcessExit,
    StreamingPipeline,
    UrlExpiry,
    DownloaderTransient,
    TranscoderTransient,
    VoiceApiTransient,
    FilesystemTransient,
    Configuration,
    Encoding,
    Unknown,
}

impl ErrorKind {
    /// Whether this kind is eligible for retry at all.
    pub fn retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::Configuration | ErrorKind::Encoding | ErrorKind::Unknown
        )
    }

    /// Streaming-class failures use the fixed {2s, 5s, 10s} schedule
    /// instead of exponential backoff.
    pub fn uses_streaming_schedule(self) -> bool {
        matches!(
            self,
            ErrorKind::StreamingPipeline
                | ErrorKind::UrlExpiry
                | ErrorKind::DownloaderTransient
                | ErrorKind::TranscoderTransient
        )
    }

    /// Whether a retry for this kind must re-resolve the stream URL first.
    pub fn triggers_url_refresh(self) -> bool {
        matches!(self, ErrorKind::UrlExpiry)
    }

    /// Short user-facing message template for the notification collaborator.
    /// This module only produces the template; rendering happens elsewhere.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::NetworkTransient => "Network hiccup while streaming, retrying shortly.",
            ErrorKind::ProcessExit => "The audio helper stopped unexpectedly, restarting it.",
            ErrorKind::StreamingPipeline => "The stream pipeline stalled, restarting playback.",
            ErrorKind::UrlExpiry => "The stream link expired, fetching a fresh one.",
            ErrorKind::DownloaderTransient => "The downloader hit a temporary problem, retrying.",
            ErrorKind::TranscoderTransient => "The transcoder hit a temporary problem, retrying.",
            ErrorKind::VoiceApiTransient => "Voice service glitch, reconnecting.",
            ErrorKind::FilesystemTransient => "Temporary system resource problem, retrying.",
            ErrorKind::Configuration => "Playback is misconfigured and cannot continue.",
            ErrorKind::Encoding => "Audio encoding failed and playback cannot continue.",
            ErrorKind::Unknown => "Playback failed with an unexpected error.",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::ProcessExit => "process_exit",
            ErrorKind::StreamingPipeline => "streaming_pipeline",
            ErrorKind::UrlExpiry => "url_expiry",
            ErrorKind::DownloaderTransient => "downloader_transient",
            ErrorKind::TranscoderTransient => "transcoder_transient",
            ErrorKind::VoiceApiTransient => "voice_api_transient",
            ErrorKind::FilesystemTransient => "filesystem_transient",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification result: kind plus retry eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl Classification {
    fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: kind.retryable(),
        }
    }
}

const STREAMING_PATTERNS: &[&str] = &[
    "pipeline failed",
    "pipe broken",
    "pipe closed",
    "stream interrupted",
    "pipeline timeout",
    "coordination",
    "synchronization",
];

const URL_EXPIRY_PATTERNS: &[&str] = &[
    "url expired",
    "url invalid",
    "url not found",
    "stream url",
    "refresh failed",
    "ttl",
    "403",
    "forbidden",
];

const DOWNLOADER_PATTERNS: &[&str] = &[
    "streaming",
    "pipe",
    "stdout",
    "extraction failed",
    "format unavailable",
];

const TRANSCODER_PATTERNS: &[&str] = &[
    "pipe",
    "stdin",
    "stdout",
    "invalid data found",
    "end of file",
    "stream mapping",
];

const VOICE_API_PATTERNS: &[&str] = &[
    "1006",
    "4000",
    "rate limit",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

const PROCESS_EXIT_PATTERNS: &[&str] = &["signal: killed", "signal: terminated", "exit status"];

const NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "broken pipe",
    "i/o timeout",
    "no route to host",
    "timeout",
];

const FILESYSTEM_PATTERNS: &[&str] = &[
    "resource temporarily unavailable",
    "device busy",
    "interrupted system call",
    "i/o error",
];

const CONFIGURATION_PATTERNS: &[&str] = &["invalid config", "missing binary"];

const ENCODING_PATTERNS: &[&str] = &["opus", "pcm", "frame size", "sample rate"];

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

/// Error classifier
///
/// Carries the helper binary names so downloader/transcoder stderr text can
/// be attributed to the right kind.
#[derive(Debug, Clone)]
pub struct Classifier {
    downloader_name: String,
    transcoder_name: String,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new("yt-dlp", "ffmpeg")
    }
}

impl Classifier {
    pub fn new(downloader_name: &str, transcoder_name: &str) -> Self {
        Self {
            downloader_name: binary_stem(downloader_name),
            transcoder_name: binary_stem(transcoder_name),
        }
    }

    /// Classify an error into its kind and retry eligibility.
    pub fn classify(&self, error: &PipelineError) -> Classification {
        // Typed checks come first; only wrapped text falls through to the
        // substring tables.
        match error {
            PipelineError::Config(_) => return Classification::of(ErrorKind::Configuration),
            PipelineError::Encoding(_) => return Classification::of(ErrorKind::Encoding),
            PipelineError::VoiceSink(_) => return Classification::of(ErrorKind::VoiceApiTransient),
            PipelineError::UrlResolve(_) => return Classification::of(ErrorKind::UrlExpiry),
            PipelineError::Exhausted { source, .. } => return self.classify(source),
            PipelineError::Process {
                binary, reason, ..
            } => {
                let name = binary_stem(binary);
                if name.contains(&self.transcoder_name) {
                    return Classification::of(ErrorKind::TranscoderTransient);
                }
                if name.contains(&self.downloader_name) {
                    return Classification::of(ErrorKind::DownloaderTransient);
                }
                let text = reason.to_lowercase();
                if matches_any(&text, STREAMING_PATTERNS) {
                    return Classification::of(ErrorKind::StreamingPipeline);
                }
                return Classification::of(ErrorKind::ProcessExit);
            }
            PipelineError::Io(io) => match io.kind() {
                IoKind::TimedOut => return Classification::of(ErrorKind::NetworkTransient),
                IoKind::WouldBlock | IoKind::Interrupted => {
                    return Classification::of(ErrorKind::ProcessExit)
                }
                _ => {}
            },
            PipelineError::Stream(_) | PipelineError::Internal(_) => {}
        }

        self.classify_text(&error.to_string())
    }

    /// Classify free-form error text. Case-insensitive substring matching;
    /// streaming-family patterns take precedence over the generic kinds.
    pub fn classify_text(&self, text: &str) -> Classification {
        let text = text.to_lowercase();

        if matches_any(&text, STREAMING_PATTERNS) {
            return Classification::of(ErrorKind::StreamingPipeline);
        }
        if matches_any(&text, URL_EXPIRY_PATTERNS) {
            return Classification::of(ErrorKind::UrlExpiry);
        }
        if text.contains(&self.downloader_name)
            && (matches_any(&text, DOWNLOADER_PATTERNS) || has_http_transient(&text))
        {
            return Classification::of(ErrorKind::DownloaderTransient);
        }
        if text.contains(&self.transcoder_name)
            && (matches_any(&text, TRANSCODER_PATTERNS) || has_http_5xx(&text))
        {
            return Classification::of(ErrorKind::TranscoderTransient);
        }
        if matches_any(&text, VOICE_API_PATTERNS) {
            return Classification::of(ErrorKind::VoiceApiTransient);
        }
        if matches_any(&text, CONFIGURATION_PATTERNS) {
            return Classification::of(ErrorKind::Configuration);
        }
        if matches_any(&text, ENCODING_PATTERNS) {
            return Classification::of(ErrorKind::Encoding);
        }
        if matches_any(&text, PROCESS_EXIT_PATTERNS) {
            return Classification::of(ErrorKind::ProcessExit);
        }
        if matches_any(&text, FILESYSTEM_PATTERNS) {
            return Classification::of(ErrorKind::FilesystemTransient);
        }
        if matches_any(&text, NETWORK_PATTERNS) {
            return Classification::of(ErrorKind::NetworkTransient);
        }

        Classification::of(ErrorKind::Unknown)
    }

    /// Tag a single stderr line against the pattern sets, if any match.
    pub fn tag_stderr_line(&self, line: &str) -> Option<ErrorKind> {
        let classification = self.classify_text(line);
        if classification.kind == ErrorKind::Unknown {
            None
        } else {
            Some(classification.kind)
        }
    }
}

/// Rate-limit (429) or server-side (5xx) HTTP failure text.
fn has_http_transient(text: &str) -> bool {
    text.contains("429") || text.contains("rate limit") || has_http_5xx(text)
}

fn has_http_5xx(text: &str) -> bool {
    ["500", "502", "503", "504"].iter().any(|c| text.contains(c))
}

fn binary_stem(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new("/usr/bin/yt-dlp", "/usr/bin/ffmpeg")
    }

    #[test]
    fn test_config_not_retryable() {
        let c = classifier().classify(&PipelineError::Config("missing binary".into()));
        assert_eq!(c.kind, ErrorKind::Configuration);
        assert!(!c.retryable);
    }

    #[test]
    fn test_encoding_not_retryable() {
        let c = classifier().classify(&PipelineError::Encoding("frame size mismatch".into()));
        assert_eq!(c.kind, ErrorKind::Encoding);
        assert!(!c.retryable);
    }

    #[test]
    fn test_transcoder_exit_is_transcoder_transient() {
        let c = classifier().classify(&PipelineError::process_exit("ffmpeg", Some(1)));
        assert_eq!(c.kind, ErrorKind::TranscoderTransient);
        assert!(c.retryable);
        assert!(c.kind.uses_streaming_schedule());
    }

    #[test]
    fn test_downloader_exit_is_downloader_transient() {
        let c = classifier().classify(&PipelineError::process_exit("yt-dlp", Some(2)));
        assert_eq!(c.kind, ErrorKind::DownloaderTransient);
        assert!(c.retryable);
    }

    #[test]
    fn test_unattributed_exit_is_process_exit() {
        let c = classifier().classify(&PipelineError::process_exit("helper", Some(1)));
        assert_eq!(c.kind, ErrorKind::ProcessExit);
        assert!(c.retryable);
        assert!(!c.kind.uses_streaming_schedule());
    }

    #[test]
    fn test_io_timeout_is_network() {
        let io = std::io::Error::new(IoKind::TimedOut, "read timed out");
        let c = classifier().classify(&io.into());
        assert_eq!(c.kind, ErrorKind::NetworkTransient);
    }

    #[test]
    fn test_streaming_precedes_network() {
        // "pipeline timeout" contains "timeout" but the streaming family wins
        let c = classifier().classify_text("Pipeline Timeout waiting for frames");
        assert_eq!(c.kind, ErrorKind::StreamingPipeline);
    }

    #[test]
    fn test_http_403_is_url_expiry() {
        let c = classifier().classify_text("HTTP error 403 Forbidden");
        assert_eq!(c.kind, ErrorKind::UrlExpiry);
        assert!(c.kind.triggers_url_refresh());
    }

    #[test]
    fn test_gateway_timeout_is_voice_api() {
        let c = classifier().classify_text("upstream returned Gateway Timeout");
        assert_eq!(c.kind, ErrorKind::VoiceApiTransient);
    }

    #[test]
    fn test_downloader_rate_limit() {
        let c = classifier().classify_text("yt-dlp: HTTP Error 429: Too Many Requests");
        assert_eq!(c.kind, ErrorKind::DownloaderTransient);
    }

    #[test]
    fn test_transcoder_invalid_data() {
        let c = classifier().classify_text("ffmpeg: Invalid data found when processing input");
        assert_eq!(c.kind, ErrorKind::TranscoderTransient);
    }

    #[test]
    fn test_filesystem_transient() {
        let c = classifier().classify_text("write: Resource temporarily unavailable");
        assert_eq!(c.kind, ErrorKind::FilesystemTransient);
        assert!(c.retryable);
    }

    #[test]
    fn test_unknown_not_retryable() {
        let c = classifier().classify_text("something nobody has seen before");
        assert_eq!(c.kind, ErrorKind::Unknown);
        assert!(!c.retryable);
    }

    #[test]
    fn test_case_insensitive() {
        let c = classifier().classify_text("CONNECTION REFUSED by peer");
        assert_eq!(c.kind, ErrorKind::NetworkTransient);
    }

    #[test]
    fn test_stderr_tagging() {
        let cl = classifier();
        assert_eq!(
            cl.tag_stderr_line("ERROR: extraction failed for yt-dlp target"),
            Some(ErrorKind::DownloaderTransient)
        );
        assert_eq!(cl.tag_stderr_line("ordinary progress line"), None);
    }

    #[test]
    fn test_user_messages_exist() {
        for kind in [
            ErrorKind::NetworkTransient,
            ErrorKind::UrlExpiry,
            ErrorKind::Unknown,
        ] {
            assert!(!kind.user_message().is_empty());
        }
    }
}
