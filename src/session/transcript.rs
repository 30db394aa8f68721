//! # Transcript Reconciliation
//!
//! The speech service streams partial transcripts for both sides of the conversation.
//! Depending on the moment it sends either a cumulative restatement ("Hel", "Hello")
//! or an additive continuation ("Hel", "lo"), without saying which. The reconciler
//! folds these fragments into one pending utterance per speaker and turns them into
//! immutable transcript segments when the service signals the end of a turn.
//!
//! ## Turn Lifecycle:
//! 1. **Merge**: `merge_user` / `merge_agent` accumulate partial text
//! 2. **Commit**: `commit_turn` trims both sides and appends them to the log
//! 3. **Reset**: pending text is cleared after every commit, duplicate or not

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who said a piece of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "User",
            Speaker::Agent => "Agent",
        }
    }
}

/// One committed utterance. Never modified after it is appended to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub speaker: Speaker,
    pub text: String,
    pub committed_at: DateTime<Utc>,
}

/// The most recently committed (user, agent) pair.
#[derive(Debug, Clone, Default, PartialEq)]
struct LastCommitted {
    user_text: String,
    agent_text: String,
}

/// Merge an incoming partial transcript into the text accumulated so far.
///
/// ## Rules (first match wins):
/// - empty `incoming` → `current` unchanged
/// - `incoming` starts with `current` → `incoming` (a fuller restatement)
/// - `current` starts with `incoming` → `current` (a stale, shorter restatement)
/// - otherwise → `current` followed by `incoming` (a continuation)
pub fn merge(current: &str, incoming: &str) -> String {
    if incoming.is_empty() {
        return current.to_string();
    }
    if incoming.starts_with(current) {
        return incoming.to_string();
    }
    if current.starts_with(incoming) {
        return current.to_string();
    }
    let mut merged = String::with_capacity(current.len() + incoming.len());
    merged.push_str(current);
    merged.push_str(incoming);
    merged
}

/// Pending utterances for both speakers plus the committed log of one session.
#[derive(Debug, Default)]
pub struct TranscriptReconciler {
    pending_user: String,
    pending_agent: String,
    last_committed: LastCommitted,
    log: Vec<TranscriptSegment>,
}

impl TranscriptReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_user(&mut self, delta: &str) {
        self.pending_user = merge(&self.pending_user, delta);
    }

    pub fn merge_agent(&mut self, delta: &str) {
        self.pending_agent = merge(&self.pending_agent, delta);
    }

    /// Uncommitted user text for the current turn (the live caption).
    pub fn pending_user(&self) -> &str {
        &self.pending_user
    }

    /// Uncommitted agent text for the current turn (the live caption).
    pub fn pending_agent(&self) -> &str {
        &self.pending_agent
    }

    /// Drop the agent's in-progress utterance without committing it.
    ///
    /// Used when the agent is interrupted: what it had not finished saying never
    /// reaches the transcript. The user side is kept, since the user is usually the
    /// one who just started talking.
    pub fn discard_agent(&mut self) {
        self.pending_agent.clear();
    }

    /// Drop both in-progress utterances. The committed log is untouched.
    pub fn discard_pending(&mut self) {
        self.pending_user.clear();
        self.pending_agent.clear();
    }

    /// Finalize the current turn.
    ///
    /// A turn whose trimmed (user, agent) pair equals the previously committed pair is
    /// treated as an echo from the service and appends nothing. The comparison is on
    /// the pair as a whole, not per speaker.
    ///
    /// Returns the segments appended by this call, in log order.
    pub fn commit_turn(&mut self) -> Vec<TranscriptSegment> {
        let user_text = self.pending_user.trim().to_string();
        let agent_text = self.pending_agent.trim().to_string();
        self.pending_user.clear();
        self.pending_agent.clear();

        if user_text == self.last_committed.user_text && agent_text == self.last_committed.agent_text {
            tracing::debug!("Suppressing duplicate turn");
            return Vec::new();
        }

        self.last_committed = LastCommitted {
            user_text: user_text.clone(),
            agent_text: agent_text.clone(),
        };

        let committed_at = Utc::now();
        let mut appended = Vec::with_capacity(2);
        if !user_text.is_empty() {
            appended.push(TranscriptSegment {
                speaker: Speaker::User,
                text: user_text,
                committed_at,
            });
        }
        if !agent_text.is_empty() {
            appended.push(TranscriptSegment {
                speaker: Speaker::Agent,
                text: agent_text,
                committed_at,
            });
        }
        self.log.extend(appended.iter().cloned());
        appended
    }

    /// The committed log in commit order.
    pub fn transcript(&self) -> &[TranscriptSegment] {
        &self.log
    }

    /// Hand the committed log over, leaving this reconciler empty.
    pub fn take_transcript(&mut self) -> Vec<TranscriptSegment> {
        std::mem::take(&mut self.log)
    }
}
