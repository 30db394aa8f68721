//! # Session Evaluation
//!
//! Turns a finished session's transcript into a markdown coaching report with one
//! `generateContent` request to the text-generation service.

use crate::config::EvaluationConfig;
use crate::error::SessionError;
use crate::session::transcript::TranscriptSegment;
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Returned instead of a report when nobody said anything.
pub const EMPTY_TRANSCRIPT_REPORT: &str = "## No conversation recorded\n\nThe session ended before any turn was completed, so there is nothing to evaluate yet. Start a new session and speak with the persona to get feedback.";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Speaker-labelled lines, one per segment.
pub fn format_transcript(transcript: &[TranscriptSegment]) -> String {
    transcript
        .iter()
        .map(|segment| format!("{}: {}", segment.speaker.label(), segment.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The evaluation prompt for one session.
pub fn build_prompt(config: &SessionConfig, transcript: &[TranscriptSegment]) -> String {
    let reference = if config.reference_text.trim().is_empty() {
        "(none provided)".to_string()
    } else {
        format!("{}\n{}", config.reference_label.trim(), config.reference_text.trim())
    };

    format!(
        "You are an experienced communication coach. A user just practised a spoken \
conversation with an AI role-playing the persona below. Evaluate the user's performance.\n\n\
PERSONA:\n{persona}\n\n\
REFERENCE MATERIAL:\n{reference}\n\n\
TRANSCRIPT:\n{transcript}\n\n\
Write the report in markdown with these sections:\n\
## Summary\n\
## Strengths\n\
## Areas to Improve\n\
## Suggested Phrases\n\
## Score (1-10)\n\
Quote the user's own words where it helps. Evaluate only the user, not the persona.",
        persona = config.persona.trim(),
        reference = reference,
        transcript = format_transcript(transcript),
    )
}

/// Client for the report request.
#[derive(Debug, Clone)]
pub struct EvaluationClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    api_key: String,
}

impl EvaluationClient {
    pub fn new(config: &EvaluationConfig, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: api_key.into(),
        }
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }

    /// Produce the markdown report for a finished session.
    ///
    /// An empty transcript short-circuits to [`EMPTY_TRANSCRIPT_REPORT`].
    pub async fn evaluate(
        &self,
        config: &SessionConfig,
        transcript: &[TranscriptSegment],
    ) -> Result<String, SessionError> {
        if transcript.is_empty() {
            info!("Empty transcript, skipping evaluation request");
            return Ok(EMPTY_TRANSCRIPT_REPORT.to_string());
        }
        if self.api_key.is_empty() {
            return Err(SessionError::Config("Evaluation API key is not configured".to_string()));
        }

        let request = GenerateRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: build_prompt(config, transcript),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
            },
        };

        info!(model = %self.model, segments = transcript.len(), "Requesting session evaluation");
        let response = self
            .http
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Evaluation request failed");
            return Err(SessionError::Evaluation(format!(
                "Request failed with status {}: {}",
                status, body
            )));
        }

        let parsed: GenerateResponse = response.json().await?;
        extract_report(parsed)
    }
}

fn extract_report(response: GenerateResponse) -> Result<String, SessionError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(SessionError::Evaluation(format!("Request was blocked: {}", reason)));
    }

    let text: String = response
        .candidates
        .and_then(|candidates| candidates.into_iter().next())
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    let text = text.trim();
    if text.is_empty() {
        return Err(SessionError::Evaluation("Response contained no report".to_string()));
    }
    Ok(text.to_string())
}
