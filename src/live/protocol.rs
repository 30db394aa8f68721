//! # Live Service Wire Protocol
//!
//! JSON messages exchanged with the bidirectional streaming endpoint.
//!
//! ## Client → Service:
//! - **setup**: sent once, first: model, voice, response modality, transcription
//!   requests, system instruction
//! - **realtimeInput**: one per microphone frame, base64 PCM
//!
//! ## Service → Client:
//! - **setupComplete**: handshake done
//! - **serverContent**: any combination of transcripts, audio parts, `interrupted` and
//!   `turnComplete` in one message
//! - **goAway**: the service is about to drop the connection
//!
//! Inbound messages are flattened into the [`LiveEvent`] tagged union, which is the
//! only thing the session controller ever sees.

use crate::audio::capture::EncodedFrame;
use crate::error::SessionError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Everything the service can tell a session.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Partial transcript of what the user said
    InputTranscript(String),
    /// Partial transcript of what the agent is saying
    OutputTranscript(String),
    /// The current turn is finished
    TurnComplete,
    /// 16-bit PCM agent audio (24 kHz, mono)
    Audio(Vec<u8>),
    /// The agent was cut off; its queued audio must be discarded
    Interrupted,
    /// The connection failed
    Error(String),
    /// The connection closed, with the service's reason if it gave one
    Closed(Option<String>),
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub input_audio_transcription: AudioTranscriptionConfig,
    pub output_audio_transcription: AudioTranscriptionConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Serializes as `{}`: presence alone switches transcription on.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioTranscriptionConfig {}

impl SetupMessage {
    /// Audio-only responses with both directions transcribed.
    pub fn new(model: &str, voice: &str, system_instruction: String) -> Self {
        Self {
            setup: Setup {
                model: model.to_string(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: voice.to_string(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: system_instruction,
                    }],
                },
                input_audio_transcription: AudioTranscriptionConfig::default(),
                output_audio_transcription: AudioTranscriptionConfig::default(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

impl From<EncodedFrame> for RealtimeInputMessage {
    fn from(frame: EncodedFrame) -> Self {
        Self {
            realtime_input: RealtimeInput {
                audio: Blob {
                    data: frame.data,
                    mime_type: frame.mime_type,
                },
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// One parsed server message.
#[derive(Debug, Default, PartialEq)]
pub struct ServerFrame {
    pub setup_complete: bool,
    pub events: Vec<LiveEvent>,
}

/// Parse one server message into events.
///
/// ## Event Order:
/// Input transcript, output transcript, audio parts, interrupted, turn complete.
/// Turn completion goes last so a turn's final deltas are merged before it commits.
///
/// ## Errors:
/// Malformed JSON is a protocol error. A single audio part with bad base64 is only
/// logged and skipped, like any other undecodable chunk.
pub fn parse_server_message(text: &str) -> Result<ServerFrame, SessionError> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| SessionError::Protocol(format!("Invalid server message: {}", e)))?;

    let mut frame = ServerFrame {
        setup_complete: message.setup_complete.is_some(),
        events: Vec::new(),
    };

    if let Some(content) = message.server_content {
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                frame.events.push(LiveEvent::InputTranscript(text));
            }
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                frame.events.push(LiveEvent::OutputTranscript(text));
            }
        }
        if let Some(turn) = content.model_turn {
            for inline in turn.parts.into_iter().filter_map(|p| p.inline_data) {
                if let Some(mime) = inline.mime_type.as_deref() {
                    if !mime.starts_with("audio/pcm") {
                        warn!(mime_type = %mime, "Ignoring non-PCM inline data");
                        continue;
                    }
                }
                match BASE64.decode(inline.data.as_bytes()) {
                    Ok(bytes) => frame.events.push(LiveEvent::Audio(bytes)),
                    Err(e) => warn!("Dropping audio part with invalid base64: {}", e),
                }
            }
        }
        if content.interrupted {
            frame.events.push(LiveEvent::Interrupted);
        }
        if content.turn_complete {
            frame.events.push(LiveEvent::TurnComplete);
        }
    }

    if let Some(go_away) = message.go_away {
        let reason = match go_away.time_left {
            Some(left) => format!("Service is closing the session (time left: {})", left),
            None => "Service is closing the session".to_string(),
        };
        frame.events.push(LiveEvent::Closed(Some(reason)));
    }

    Ok(frame)
}
