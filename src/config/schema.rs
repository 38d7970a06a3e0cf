use serde::{Deserialize, Serialize};

use crate::audio::frame::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::{PipelineError, Result};

/// Accepted log levels for the pipeline and logger groups
pub const LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

/// Accepted raw audio formats for the transcoder output
pub const AUDIO_FORMATS: &[&str] = &["s16le", "s16be", "s32le", "s32be", "f32le", "f32be"];

/// Main pipeline configuration
///
/// Parsing the on-disk form is out of scope here; callers hand the pipeline
/// an already-deserialized value and `validate()` decides whether it is
/// usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipeline scheduling settings
    pub pipeline: PipelineSettings,
    /// Downloader helper settings
    pub downloader: DownloaderConfig,
    /// Transcoder helper settings
    pub transcoder: TranscoderConfig,
    /// Opus encoder settings
    pub opus: OpusSettings,
    /// Retry and backoff settings
    pub retry: RetrySettings,
    /// Logger settings
    pub logger: LoggerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineSettings::default(),
            downloader: DownloaderConfig::default(),
            transcoder: TranscoderConfig::default(),
            opus: OpusSettings::default(),
            retry: RetrySettings::default(),
            logger: LoggerConfig::default(),
        }
    }
}

/// Pipeline scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Retry budget for a play session
    pub retry_count: u32,
    /// Stall timeout: seconds without PCM bytes before the read is failed
    pub timeout_seconds: u64,
    /// Log level for pipeline events
    pub log_level: String,
    /// Grace window before escalating terminate to kill, in seconds
    pub stop_grace_seconds: u64,
    /// Most recent stderr lines retained per child
    pub max_stderr_lines: usize,
    /// URL substrings that select direct mode (transcoder reads the URL itself)
    pub direct_url_patterns: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry_count: 3,
            timeout_seconds: 10,
            log_level: "info".to_string(),
            stop_grace_seconds: 5,
            max_stderr_lines: 50,
            direct_url_patterns: Vec::new(),
        }
    }
}

/// Downloader helper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Path to the downloader binary
    pub binary_path: String,
    /// Extra arguments appended to the pipe-mode invocation
    pub extra_args: Vec<String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            binary_path: "yt-dlp".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Transcoder helper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    /// Path to the transcoder binary
    pub binary_path: String,
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Output channel count
    pub channels: u32,
    /// Raw output sample format
    pub audio_format: String,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            audio_format: "s16le".to_string(),
        }
    }
}

/// Opus encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusSettings {
    /// Target bitrate in bps
    pub bitrate: u32,
    /// Samples per channel per frame
    pub frame_size: u32,
}

impl Default for OpusSettings {
    fn default() -> Self {
        Self {
            bitrate: 128_000,
            frame_size: FRAME_SAMPLES,
        }
    }
}

/// Retry and URL-refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum retry attempts before giving up
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds
    pub base_delay_ms: u64,
    /// Backoff cap, in milliseconds
    pub max_delay_ms: u64,
    /// Exponential multiplier (must be > 1.0)
    pub multiplier: f64,
    /// Resolved URLs older than this are re-resolved before a retry, seconds
    pub url_freshness_seconds: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            url_freshness_seconds: 240,
        }
    }
}

/// Logger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Log level: debug, info, warn, error
    pub level: String,
    /// Output format: json or text
    pub format: String,
    /// Whether diagnostic records are persisted through the sink
    pub save_to_db: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            save_to_db: false,
        }
    }
}

impl PipelineConfig {
    /// Validate every constraint; the first violation is returned as a
    /// `Config` error and prevents `play`.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.timeout_seconds == 0 {
            return Err(invalid("pipeline.timeout_seconds must be > 0"));
        }
        if !LOG_LEVELS.contains(&self.pipeline.log_level.as_str()) {
            return Err(invalid("pipeline.log_level must be one of debug/info/warn/error"));
        }
        if self.pipeline.stop_grace_seconds == 0 {
            return Err(invalid("pipeline.stop_grace_seconds must be > 0"));
        }
        if self.pipeline.max_stderr_lines == 0 {
            return Err(invalid("pipeline.max_stderr_lines must be > 0"));
        }
        if self.downloader.binary_path.is_empty() {
            return Err(invalid("downloader.binary_path must not be empty"));
        }
        if self.transcoder.binary_path.is_empty() {
            return Err(invalid("transcoder.binary_path must not be empty"));
        }
        if self.transcoder.sample_rate == 0 {
            return Err(invalid("transcoder.sample_rate must be > 0"));
        }
        if self.transcoder.channels == 0 {
            return Err(invalid("transcoder.channels must be > 0"));
        }
        if !AUDIO_FORMATS.contains(&self.transcoder.audio_format.as_str()) {
            return Err(invalid("transcoder.audio_format must be a raw PCM format"));
        }
        if self.opus.bitrate == 0 {
            return Err(invalid("opus.bitrate must be > 0"));
        }
        if self.opus.frame_size == 0 {
            return Err(invalid("opus.frame_size must be > 0"));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(invalid("retry.base_delay_ms must be > 0"));
        }
        if self.retry.max_delay_ms == 0 {
            return Err(invalid("retry.max_delay_ms must be > 0"));
        }
        if self.retry.multiplier <= 1.0 {
            return Err(invalid("retry.multiplier must be > 1.0"));
        }
        if !LOG_LEVELS.contains(&self.logger.level.as_str()) {
            return Err(invalid("logger.level must be one of debug/info/warn/error"));
        }
        if self.logger.format != "json" && self.logger.format != "text" {
            return Err(invalid("logger.format must be json or text"));
        }
        Ok(())
    }

    /// Clamp the audio parameters to the voice contract. The transcoder
    /// always emits 48kHz stereo S16LE and the encoder consumes 960-sample
    /// frames; anything else in the config is overridden with a warning.
    pub fn enforce_voice_contract(&mut self) {
        if self.transcoder.sample_rate != SAMPLE_RATE {
            tracing::warn!(
                configured = self.transcoder.sample_rate,
                "Overriding sample rate to {} for the voice contract",
                SAMPLE_RATE
            );
            self.transcoder.sample_rate = SAMPLE_RATE;
        }
        if self.transcoder.channels != CHANNELS {
            tracing::warn!(
                configured = self.transcoder.channels,
                "Overriding channel count to {} for the voice contract",
                CHANNELS
            );
            self.transcoder.channels = CHANNELS;
        }
        if self.transcoder.audio_format != "s16le" {
            tracing::warn!(
                configured = %self.transcoder.audio_format,
                "Overriding audio format to s16le for the voice contract"
            );
            self.transcoder.audio_format = "s16le".to_string();
        }
        if self.opus.frame_size != FRAME_SAMPLES {
            tracing::warn!(
                configured = self.opus.frame_size,
                "Overriding Opus frame size to {} for the voice contract",
                FRAME_SAMPLES
            );
            self.opus.frame_size = FRAME_SAMPLES;
        }
    }
}

fn invalid(msg: &str) -> PipelineError {
    PipelineError::Config(format!("invalid config: {}", msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = PipelineConfig::default();
        config.pipeline.timeout_seconds = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_seconds"));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = PipelineConfig::default();
        config.logger.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_format_rejected() {
        let mut config = PipelineConfig::default();
        config.logger.format = "yaml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_binary_path_rejected() {
        let mut config = PipelineConfig::default();
        config.transcoder.binary_path.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_audio_format_rejected() {
        let mut config = PipelineConfig::default();
        config.transcoder.audio_format = "mp3".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multiplier_must_exceed_one() {
        let mut config = PipelineConfig::default();
        config.retry.multiplier = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_voice_contract_enforced() {
        let mut config = PipelineConfig::default();
        config.transcoder.sample_rate = 44_100;
        config.transcoder.channels = 1;
        config.opus.frame_size = 480;
        config.enforce_voice_contract();
        assert_eq!(config.transcoder.sample_rate, 48_000);
        assert_eq!(config.transcoder.channels, 2);
        assert_eq!(config.opus.frame_size, 960);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"opus": {"bitrate": 96000}}"#).unwrap();
        assert_eq!(config.opus.bitrate, 96_000);
        assert_eq!(config.opus.frame_size, 960);
        assert!(config.validate().is_ok());
    }
}
