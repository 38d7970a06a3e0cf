//! Diagnostic record and metric sample types

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::classify::ErrorKind;

/// Severity of a diagnostic record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl DiagLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagLevel::Debug => "debug",
            DiagLevel::Info => "info",
            DiagLevel::Warn => "warn",
            DiagLevel::Error => "error",
        }
    }
}

/// One structured diagnostic record
///
/// Records are what the external sink persists; the fields map carries
/// whatever context the emitting component attaches (attempt number, delay,
/// context tag, child pid).
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticRecord {
    pub level: DiagLevel,
    pub message: String,
    /// Error text, when the record describes a failure
    pub error: Option<String>,
    /// Free-form context fields
    pub fields: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    /// Session the record belongs to, if any
    pub session_id: Option<Uuid>,
    /// Emitting component, e.g. "controller", "process_manager"
    pub source: String,
}

impl DiagnosticRecord {
    pub fn new(source: &str, level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            error: None,
            fields: HashMap::new(),
            timestamp: Utc::now(),
            session_id: None,
            source: source.to_string(),
        }
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Typed metric samples the pipeline emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricSample {
    /// Time from play() to the first delivered frame
    StartupTime(Duration),
    /// Total playback duration of a finished session
    PlaybackDuration(Duration),
    /// One error of the given kind occurred
    ErrorKindTick(ErrorKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let id = Uuid::new_v4();
        let record = DiagnosticRecord::new("controller", DiagLevel::Warn, "retrying playback")
            .with_error("pipe broken")
            .with_field("attempt", "2")
            .with_session(id);

        assert_eq!(record.source, "controller");
        assert_eq!(record.level, DiagLevel::Warn);
        assert_eq!(record.error.as_deref(), Some("pipe broken"));
        assert_eq!(record.fields.get("attempt").map(String::as_str), Some("2"));
        assert_eq!(record.session_id, Some(id));
    }

    #[test]
    fn test_record_serializes() {
        let record = DiagnosticRecord::new("retry", DiagLevel::Info, "refresh ok");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("refresh ok"));
    }
}
