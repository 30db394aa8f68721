//! # Session WebSocket Handler
//!
//! One browser tab = one `/ws/session` socket = one [`SessionController`]. The browser
//! is the microphone and the speakers; everything else happens here.
//!
//! ## WebSocket Protocol:
//! 1. **Start**: client sends `start_session` with the persona and reference document
//! 2. **Microphone**: server answers `request_microphone`; client replies `microphone`
//! 3. **Streaming**: client sends binary frames of little-endian f32 samples; server
//!    sends `open_output`, `play`, `stop_playback`, live `state` updates and one
//!    `turn` message per committed turn
//! 4. **End**: client sends `end_session`; server replies `transcript`, then `report`
//!    (or `report_error`)
//!
//! ## Message Format:
//! - **Client → Server**: JSON text tagged by `type`, plus binary microphone frames
//! - **Server → Client**: JSON text tagged by `type`

use crate::audio::capture::encode_pcm16;
use crate::audio::relay::{decode_f32_samples, MicrophoneAnswer, RelayBackend, RelayCommand};
use crate::evaluation::EvaluationClient;
use crate::live::WebSocketTransport;
use crate::session::transcript::TranscriptSegment;
use crate::session::{
    CommittedTurn, SessionConfig, SessionController, SessionObserver, SessionSettings, SessionView, StartOutcome,
};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages from the browser.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession {
        persona: String,
        #[serde(default)]
        reference_text: String,
        #[serde(default)]
        reference_label: String,
    },
    /// Answer to `request_microphone`
    Microphone {
        granted: bool,
        /// Rate the browser actually captures at
        sample_rate: Option<u32>,
    },
    /// A `play` buffer reached its natural end
    PlaybackEnded { epoch: u64, id: u64 },
    StopSession,
    EndSession,
    Pong { timestamp: u64 },
}

/// Messages to the browser.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RequestMicrophone { sample_rate: u32 },
    StopMicrophone,
    /// Anchor a fresh playback clock at zero
    OpenOutput { epoch: u64, sample_rate: u32 },
    CloseOutput { epoch: u64 },
    /// Base64 16-bit PCM to start at `start_at` seconds on the output clock
    Play {
        epoch: u64,
        id: u64,
        start_at: f64,
        sample_rate: u32,
        data: String,
    },
    StopPlayback { epoch: u64, ids: Vec<u64> },
    State { view: SessionView },
    /// Segments a finished turn appended to the transcript
    Turn { epoch: u64, segments: Vec<TranscriptSegment> },
    SessionStarted { epoch: u64 },
    Transcript { segments: Vec<TranscriptSegment> },
    Report { markdown: String },
    ReportError { message: String },
    Error { code: String, message: String },
    Ping { timestamp: u64 },
}

impl From<RelayCommand> for ServerMessage {
    fn from(command: RelayCommand) -> Self {
        match command {
            RelayCommand::RequestMicrophone { sample_rate } => ServerMessage::RequestMicrophone { sample_rate },
            RelayCommand::StopMicrophone => ServerMessage::StopMicrophone,
            RelayCommand::OpenOutput { epoch, sample_rate } => ServerMessage::OpenOutput { epoch, sample_rate },
            RelayCommand::Play {
                epoch,
                id,
                start_at,
                sample_rate,
                samples,
            } => ServerMessage::Play {
                epoch,
                id,
                start_at,
                sample_rate,
                data: BASE64.encode(encode_pcm16(&samples)),
            },
            RelayCommand::StopPlayback { epoch, ids } => ServerMessage::StopPlayback { epoch, ids },
            RelayCommand::CloseOutput { epoch } => ServerMessage::CloseOutput { epoch },
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// WebSocket actor driving one live session.
///
/// ## Actor Model:
/// The actor owns the socket. The controller runs its own tokio tasks and talks back
/// through streams attached to this actor: relay commands (audio I/O for the
/// browser), live view updates and committed turns.
pub struct SessionSocket {
    /// Correlates log lines for this connection
    connection_id: Uuid,
    state: AppState,
    controller: SessionController,
    relay: RelayBackend,
    relay_commands: Option<mpsc::UnboundedReceiver<RelayCommand>>,
    evaluator: EvaluationClient,
    /// Config of the most recent `start_session`, needed for the report
    session_config: Option<SessionConfig>,
    /// Whether this socket holds one of the server's live-session slots
    holds_slot: bool,
    last_heartbeat: Instant,
}

impl SessionSocket {
    pub fn new(state: AppState) -> Self {
        let config = state.get_config();
        let (relay, relay_commands) = RelayBackend::new();
        let transport = WebSocketTransport::new(config.live.endpoint.clone(), config.live.api_key.clone());
        let observer: Arc<dyn SessionObserver> = Arc::new(state.clone());
        let controller = SessionController::new(
            Arc::new(relay.clone()),
            Arc::new(transport),
            SessionSettings::from_config(&config),
            observer,
        );

        Self {
            connection_id: Uuid::new_v4(),
            evaluator: EvaluationClient::new(&config.evaluation, config.live.api_key.clone()),
            state,
            controller,
            relay,
            relay_commands: Some(relay_commands),
            session_config: None,
            holds_slot: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(connection_id = %self.connection_id, "Failed to encode message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(connection_id = %self.connection_id, "WebSocket error {}: {}", code, message);
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn release_slot(&mut self) {
        if self.holds_slot {
            self.state.release_session();
            self.holds_slot = false;
        }
    }

    fn handle_start(&mut self, config: SessionConfig, ctx: &mut ws::WebsocketContext<Self>) {
        if let Err(e) = config.validate() {
            self.send_error(ctx, e.code(), &e.to_string());
            return;
        }
        if !self.holds_slot {
            if !self.state.try_reserve_session() {
                self.send_error(ctx, "capacity", "All live session slots are in use, try again later");
                return;
            }
            self.holds_slot = true;
        }

        info!(connection_id = %self.connection_id, "Start requested");
        self.session_config = Some(config.clone());
        let controller = self.controller.clone();
        ctx.spawn(
            async move { controller.start(config).await }
                .into_actor(self)
                .map(|result, act, ctx| match result {
                    Ok(StartOutcome::Started(epoch)) => {
                        act.send(ctx, &ServerMessage::SessionStarted { epoch });
                    }
                    Ok(StartOutcome::Superseded) => {
                        debug!(connection_id = %act.connection_id, "Start superseded");
                    }
                    Err(e) => {
                        act.send_error(ctx, e.code(), &e.to_string());
                        // A newer start may already own the session
                        if !act.controller.is_active() {
                            act.release_slot();
                        }
                    }
                }),
        );
    }

    fn handle_end(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let transcript = self.controller.end();
        self.release_slot();
        self.send(
            ctx,
            &ServerMessage::Transcript {
                segments: transcript.clone(),
            },
        );

        let Some(config) = self.session_config.take() else {
            self.send(
                ctx,
                &ServerMessage::ReportError {
                    message: "No session was started on this connection".to_string(),
                },
            );
            return;
        };

        let evaluator = self.evaluator.clone();
        ctx.spawn(
            async move { evaluator.evaluate(&config, &transcript).await }
                .into_actor(self)
                .map(|result, act, ctx| match result {
                    Ok(markdown) => {
                        act.state.record_report(true);
                        act.send(ctx, &ServerMessage::Report { markdown });
                    }
                    Err(e) => {
                        act.state.record_report(false);
                        warn!(connection_id = %act.connection_id, "Report generation failed: {}", e);
                        act.send(
                            ctx,
                            &ServerMessage::ReportError {
                                message: e.to_string(),
                            },
                        );
                    }
                }),
        );
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::StartSession {
                persona,
                reference_text,
                reference_label,
            }) => {
                let config = SessionConfig {
                    persona,
                    reference_text,
                    reference_label,
                };
                self.handle_start(config, ctx);
            }
            Ok(ClientMessage::Microphone { granted, sample_rate }) => {
                if !self.relay.resolve_permission(MicrophoneAnswer { granted, sample_rate }) {
                    debug!(connection_id = %self.connection_id, "Unsolicited microphone answer");
                }
            }
            Ok(ClientMessage::PlaybackEnded { epoch, id }) => {
                self.controller.playback_finished(epoch, id);
            }
            Ok(ClientMessage::StopSession) => {
                self.controller.stop();
                self.release_slot();
            }
            Ok(ClientMessage::EndSession) => self.handle_end(ctx),
            Ok(ClientMessage::Pong { .. }) => {
                self.last_heartbeat = Instant::now();
            }
            Err(err) => {
                self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
            }
        }
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "Session socket connected");

        if let Some(commands) = self.relay_commands.take() {
            ctx.add_stream(UnboundedReceiverStream::new(commands));
        }
        ctx.add_stream(WatchStream::new(self.controller.view()));
        if let Some(turns) = self.controller.take_turns() {
            ctx.add_stream(UnboundedReceiverStream::new(turns));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(connection_id = %act.connection_id, "Heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            act.send(ctx, &ServerMessage::Ping { timestamp: now_millis() });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.controller.stop();
        self.release_slot();
        info!(connection_id = %self.connection_id, "Session socket closed");
    }
}

/// Browser I/O requested by the session.
impl StreamHandler<RelayCommand> for SessionSocket {
    fn handle(&mut self, command: RelayCommand, ctx: &mut Self::Context) {
        self.send(ctx, &ServerMessage::from(command));
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(connection_id = %self.connection_id, "Relay command stream ended");
    }
}

/// Session view changes.
impl StreamHandler<SessionView> for SessionSocket {
    fn handle(&mut self, view: SessionView, ctx: &mut Self::Context) {
        self.send(ctx, &ServerMessage::State { view });
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(connection_id = %self.connection_id, "View stream ended");
    }
}

/// Turns committed to the transcript.
impl StreamHandler<CommittedTurn> for SessionSocket {
    fn handle(&mut self, turn: CommittedTurn, ctx: &mut Self::Context) {
        self.send(
            ctx,
            &ServerMessage::Turn {
                epoch: turn.epoch,
                segments: turn.segments,
            },
        );
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(connection_id = %self.connection_id, "Turn stream ended");
    }
}

/// Incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => match decode_f32_samples(&data) {
                Ok(samples) => self.relay.push_samples(samples),
                Err(e) => self.send_error(ctx, e.code(), &e.to_string()),
            },
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler for `/ws/session`.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New session socket from: {:?}", req.connection_info().peer_addr());
    ws::start(SessionSocket::new(app_state.get_ref().clone()), &req, stream)
}
