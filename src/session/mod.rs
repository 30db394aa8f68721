//! # Live Session Management
//!
//! One voice-training session: a persistent connection to the speech service, the
//! microphone streaming into it, the agent's audio playing back, and the transcript of
//! both sides building up turn by turn.
//!
//! ## Key Components:
//! - **Controller**: start/stop lifecycle and epoch-guarded event dispatch
//! - **Epoch**: generation counter that makes stale async work harmless
//! - **Transcript**: partial-transcript merging and turn commits

pub mod controller;
pub mod epoch;
pub mod transcript;

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use transcript::TranscriptSegment;

pub use controller::{SessionController, SessionObserver, SessionSettings, StartOutcome};

/// What the agent should be for this session. Fixed once the session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Description of the character the agent plays
    pub persona: String,
    /// Extracted text of the reference document (may be empty)
    #[serde(default)]
    pub reference_text: String,
    /// Display name of the reference document
    #[serde(default)]
    pub reference_label: String,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.persona.trim().is_empty() {
            return Err(SessionError::Config("Persona must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Segments one turn appended to the transcript, published once per commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommittedTurn {
    pub epoch: u64,
    pub segments: Vec<TranscriptSegment>,
}

/// Live state of a session as the UI sees it. Committed turns travel separately
/// as [`CommittedTurn`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionView {
    pub epoch: u64,
    pub active: bool,
    /// Live caption of what the user is saying
    pub user_caption: String,
    /// Live caption of what the agent is saying
    pub agent_caption: String,
    pub agent_speaking: bool,
    /// Why the last session ended abnormally, if it did
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_requires_persona() {
        let config = SessionConfig {
            persona: "  ".to_string(),
            reference_text: String::new(),
            reference_label: String::new(),
        };
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_config_reference_is_optional() {
        let config: SessionConfig = serde_json::from_str(r#"{"persona": "A patient"}"#).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.reference_text.is_empty());
    }
}
