//! Play session state
//!
//! One session per play request. The state machine only moves along the
//! edges the controller drives:
//!
//! ```text
//! Stopped -> Starting -> Playing -> Stopped
//!               |           |
//!               v           v
//!             Error  ->  Stopped
//!             (retry back to Starting)
//! ```

use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::process::ProcessInfo;

/// Pipeline session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// No session: no children, no encoder session, no frame loop
    #[default]
    Stopped,
    /// Children starting, awaiting the first PCM bytes
    Starting,
    /// Frame loop delivering Opus packets
    Playing,
    /// A failure surfaced; the retry engine decides what happens next
    Error,
}

impl PipelineState {
    /// Legal edges of the session state machine.
    pub fn can_transition(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Playing)
                | (Starting, Error)
                | (Starting, Stopped)
                | (Playing, Error)
                | (Playing, Stopped)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Playing => "playing",
            PipelineState::Error => "error",
        };
        f.write_str(name)
    }
}

/// The unit of one play request, owned by the controller task
#[derive(Debug, Clone)]
pub struct PipelineSession {
    pub id: Uuid,
    /// The URL the user asked for
    pub source_url: String,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    /// Attempts consumed so far (incremented before asking the engine)
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl PipelineSession {
    pub fn new(source_url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.to_string(),
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            attempt: 0,
            last_error: None,
        }
    }
}

/// Point-in-time view of the controller, safe to serialize for operators
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub playing: bool,
    pub source_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub frames_read: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub process: ProcessInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use PipelineState::*;
        assert!(Stopped.can_transition(Starting));
        assert!(Starting.can_transition(Playing));
        assert!(Starting.can_transition(Error));
        assert!(Playing.can_transition(Error));
        assert!(Playing.can_transition(Stopped));
        assert!(Error.can_transition(Starting));
        assert!(Error.can_transition(Stopped));
    }

    #[test]
    fn test_illegal_transitions() {
        use PipelineState::*;
        // No way into Playing except through Starting
        assert!(!Stopped.can_transition(Playing));
        assert!(!Error.can_transition(Playing));
        // No way out of Stopped except play()
        assert!(!Stopped.can_transition(Error));
        assert!(!Stopped.can_transition(Stopped));
        // Playing never goes back to Starting directly
        assert!(!Playing.can_transition(Starting));
    }

    #[test]
    fn test_new_session_fields() {
        let session = PipelineSession::new("https://video.example/v");
        assert_eq!(session.source_url, "https://video.example/v");
        assert_eq!(session.attempt, 0);
        assert!(session.last_error.is_none());
    }
}
