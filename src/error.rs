use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process error [{binary}]: {reason}")]
    Process {
        binary: String,
        reason: String,
        exit_code: Option<i32>,
    },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("URL resolve error: {0}")]
    UrlResolve(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Voice sink error: {0}")]
    VoiceSink(String),

    #[error("Playback failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Build a child-process error from an exit status.
    pub fn process_exit(binary: &str, exit_code: Option<i32>) -> Self {
        let reason = match exit_code {
            Some(code) => format!("exit status {}", code),
            None => "signal: killed".to_string(),
        };
        Self::Process {
            binary: binary.to_string(),
            reason,
            exit_code,
        }
    }

    /// Wrap the final failure once the retry budget is spent.
    pub fn exhausted(attempts: u32, source: PipelineError) -> Self {
        Self::Exhausted {
            attempts,
            source: Box::new(source),
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exit_message() {
        let err = PipelineError::process_exit("ffmpeg", Some(1));
        assert_eq!(err.to_string(), "Process error [ffmpeg]: exit status 1");

        let err = PipelineError::process_exit("yt-dlp", None);
        assert!(err.to_string().contains("signal: killed"));
    }

    #[test]
    fn test_exhausted_wraps_source() {
        let inner = PipelineError::Stream("pipe broken".to_string());
        let err = PipelineError::exhausted(3, inner);
        let text = err.to_string();
        assert!(text.contains("after 3 attempts"));
        assert!(text.contains("pipe broken"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "i/o timeout");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Io(_)));
    }
}
