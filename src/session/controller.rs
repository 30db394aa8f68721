//! # Session Controller
//!
//! Owns the lifecycle of one voice session and is the only place session state is
//! mutated.
//!
//! ## Concurrency Model:
//! - All mutable state lives behind one `std::sync::Mutex` that is never held across
//!   an `.await`
//! - Every async operation carries an [`EpochToken`]; start/stop advance the epoch
//!   under the same lock, so "is this still current?" and "apply the effect" happen
//!   atomically
//! - Inbound service events are delivered through [`SessionController::dispatch`] with
//!   the epoch they were received under; mismatches are dropped
//!
//! ## Start Sequence:
//! 1. Tear down whatever is running, advance to epoch E
//! 2. Acquire the microphone and the output device
//! 3. Open the live connection (setup handshake)
//! 4. If E is still current, install everything and spawn the capture pipeline and
//!    the event pump; otherwise release what was acquired and report `Superseded`

use crate::audio::capture::{run_capture, FrameResampler};
use crate::audio::device::{AudioBackend, MediaTracks};
use crate::audio::playback::PlaybackScheduler;
use crate::config::AppConfig;
use crate::error::SessionError;
use crate::live::instruction::build_system_instruction;
use crate::live::{ConnectionCloser, LiveConnection, LiveEvent, LiveTransport, SetupMessage};
use crate::session::epoch::{EpochCounter, EpochToken};
use crate::session::transcript::{TranscriptReconciler, TranscriptSegment};
use crate::session::{CommittedTurn, SessionConfig, SessionView};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// How a call to [`SessionController::start`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The session is running under this epoch
    Started(u64),
    /// A stop or another start overtook this one; nothing was applied
    Superseded,
}

/// Per-session parameters taken from the application config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub voice: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_block_size: usize,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.live.model.clone(),
            voice: config.live.voice.clone(),
            input_sample_rate: config.audio.input_sample_rate,
            output_sample_rate: config.audio.output_sample_rate,
            capture_block_size: config.audio.capture_block_size,
        }
    }
}

/// Hooks for counting what sessions do. All methods default to nothing.
pub trait SessionObserver: Send + Sync {
    fn session_started(&self, _epoch: u64) {}
    fn session_ended(&self, _epoch: u64) {}
    fn turn_committed(&self) {}
    fn chunk_scheduled(&self) {}
    fn chunk_dropped(&self) {}
    fn connection_lost(&self) {}
}

/// Everything that exists only while a session is running.
struct ActiveSession {
    epoch: u64,
    closer: ConnectionCloser,
    tracks: Box<dyn MediaTracks>,
    scheduler: PlaybackScheduler,
}

#[derive(Default)]
struct ControllerState {
    active: Option<ActiveSession>,
    reconciler: TranscriptReconciler,
    agent_speaking: bool,
    last_error: Option<String>,
}

struct Inner {
    epoch: EpochCounter,
    state: Mutex<ControllerState>,
    view: watch::Sender<SessionView>,
    turns: mpsc::UnboundedSender<CommittedTurn>,
    turn_feed: Mutex<Option<mpsc::UnboundedReceiver<CommittedTurn>>>,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn LiveTransport>,
    settings: SessionSettings,
    observer: Arc<dyn SessionObserver>,
}

/// Handle to one session slot. Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn LiveTransport>,
        settings: SessionSettings,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let (view, _) = watch::channel(SessionView::default());
        let (turns, turn_feed) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                epoch: EpochCounter::new(),
                state: Mutex::new(ControllerState::default()),
                view,
                turns,
                turn_feed: Mutex::new(Some(turn_feed)),
                backend,
                transport,
                settings,
                observer,
            }),
        }
    }

    /// Subscribe to view updates. The receiver starts with the current view.
    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.inner.view.subscribe()
    }

    /// The stream of committed turns. Only the first caller gets it.
    pub fn take_turns(&self) -> Option<mpsc::UnboundedReceiver<CommittedTurn>> {
        self.inner
            .turn_feed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn current_epoch(&self) -> u64 {
        self.inner.epoch.current()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a session, stopping any running one first.
    ///
    /// ## Errors:
    /// - [`SessionError::Config`] for an invalid `config`
    /// - [`SessionError::Permission`] when microphone access is refused; not retried
    /// - [`SessionError::Connection`] when the live service cannot be reached
    ///
    /// In every error case the session is left inactive with all acquired resources
    /// released. A start overtaken by a stop returns `Ok(Superseded)`, not an error.
    pub async fn start(&self, config: SessionConfig) -> Result<StartOutcome, SessionError> {
        config.validate()?;

        let token = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(previous) = Self::teardown(state) {
                info!(epoch = previous, "Stopping running session before start");
                self.inner.observer.session_ended(previous);
            }
            self.inner.epoch.advance();
            state.reconciler = TranscriptReconciler::new();
            state.last_error = None;
            self.publish(state);
            self.inner.epoch.token()
        };
        let epoch = token.epoch();
        let settings = &self.inner.settings;
        info!(epoch, "Starting session");

        let input = match self.inner.backend.open_input(settings.input_sample_rate).await {
            Ok(input) => input,
            Err(_) if !token.is_current() => {
                debug!(epoch, "Microphone request outlived its start");
                return Ok(StartOutcome::Superseded);
            }
            Err(e) => {
                warn!(epoch, "Failed to acquire microphone: {}", e);
                self.record_failure(epoch, &e);
                return Err(e);
            }
        };
        let mut tracks = input.tracks;

        let framer = match FrameResampler::new(
            input.sample_rate,
            settings.input_sample_rate,
            settings.capture_block_size,
        ) {
            Ok(framer) => framer,
            Err(e) => {
                tracks.stop();
                warn!(epoch, "Microphone input is unusable: {}", e);
                self.record_failure(epoch, &e);
                return Err(e);
            }
        };

        let mut output = match self.inner.backend.open_output(settings.output_sample_rate, epoch) {
            Ok(output) => output,
            Err(e) => {
                tracks.stop();
                warn!(epoch, "Failed to open output device: {}", e);
                self.record_failure(epoch, &e);
                return Err(e);
            }
        };

        if !token.is_current() {
            tracks.stop();
            output.close();
            info!(epoch, "Start superseded while acquiring devices");
            return Ok(StartOutcome::Superseded);
        }

        let setup = SetupMessage::new(
            &settings.model,
            &settings.voice,
            build_system_instruction(&config),
        );
        let connection = match self.inner.transport.connect(setup).await {
            Ok(connection) => connection,
            Err(e) => {
                tracks.stop();
                output.close();
                if !token.is_current() {
                    debug!(epoch, "Connection failure after start was superseded: {}", e);
                    return Ok(StartOutcome::Superseded);
                }
                error!(epoch, "Failed to open live connection: {}", e);
                self.record_failure(epoch, &e);
                return Err(e);
            }
        };
        let LiveConnection {
            audio,
            events,
            mut closer,
        } = connection;

        let mut guard = self.lock();
        let state = &mut *guard;
        if !token.is_current() {
            closer.close();
            tracks.stop();
            output.close();
            info!(epoch, "Start superseded during connection setup");
            return Ok(StartOutcome::Superseded);
        }

        tokio::spawn(run_capture(input.frames, framer, audio, token.clone()));
        tokio::spawn(pump_events(self.clone(), events, token));

        state.active = Some(ActiveSession {
            epoch,
            closer,
            tracks,
            scheduler: PlaybackScheduler::new(output),
        });
        self.publish(state);
        self.inner.observer.session_started(epoch);
        info!(epoch, "Session started");
        Ok(StartOutcome::Started(epoch))
    }

    /// Stop the session. Safe to call at any time, any number of times.
    pub fn stop(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        // Advance even when idle so a start still acquiring devices is superseded
        let epoch = self.inner.epoch.advance();
        match Self::teardown(state) {
            Some(ended) => {
                info!(epoch = ended, "Session stopped");
                self.inner.observer.session_ended(ended);
                self.publish(state);
            }
            None => debug!(epoch, "Stop with no running session"),
        }
    }

    /// Stop and hand over the committed transcript, in commit order.
    pub fn end(&self) -> Vec<TranscriptSegment> {
        self.stop();
        let transcript = self.lock().reconciler.take_transcript();
        info!(segments = transcript.len(), "Session ended");
        transcript
    }

    /// Apply one service event received under `epoch`.
    pub fn dispatch(&self, epoch: u64, event: LiveEvent) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !self.is_live(state, epoch) {
            debug!(epoch, current = self.inner.epoch.current(), "Dropping stale live event");
            return;
        }

        match event {
            LiveEvent::InputTranscript(delta) => state.reconciler.merge_user(&delta),
            LiveEvent::OutputTranscript(delta) => state.reconciler.merge_agent(&delta),
            LiveEvent::TurnComplete => {
                let appended = state.reconciler.commit_turn();
                debug!(epoch, appended = appended.len(), "Turn complete");
                if !appended.is_empty() {
                    self.inner.observer.turn_committed();
                    let _ = self.inner.turns.send(CommittedTurn {
                        epoch,
                        segments: appended,
                    });
                }
                state.agent_speaking = false;
            }
            LiveEvent::Audio(bytes) => {
                if let Some(session) = state.active.as_mut() {
                    match session.scheduler.enqueue(&bytes) {
                        Ok(chunk) => {
                            state.agent_speaking = true;
                            self.inner.observer.chunk_scheduled();
                            debug!(epoch, id = chunk.id, start_at = chunk.start_at, "Scheduled agent audio");
                        }
                        Err(e) => {
                            warn!(epoch, "Dropping agent audio chunk: {}", e);
                            self.inner.observer.chunk_dropped();
                        }
                    }
                }
            }
            LiveEvent::Interrupted => {
                let stopped = state
                    .active
                    .as_mut()
                    .map(|session| session.scheduler.flush())
                    .unwrap_or_default();
                state.agent_speaking = false;
                state.reconciler.discard_agent();
                info!(epoch, stopped = stopped.len(), "Agent interrupted");
            }
            LiveEvent::Error(message) => {
                error!(epoch, "Live connection error: {}", message);
                state.last_error = Some(message);
                self.fail_locked(state);
            }
            LiveEvent::Closed(reason) => {
                info!(epoch, reason = reason.as_deref().unwrap_or(""), "Live connection closed");
                state.last_error = reason;
                self.fail_locked(state);
            }
        }

        self.publish(state);
    }

    /// A buffer reached its natural end on the output device.
    pub fn playback_finished(&self, epoch: u64, id: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !self.is_live(state, epoch) {
            debug!(epoch, id, "Dropping stale playback completion");
            return;
        }
        if let Some(session) = state.active.as_mut() {
            if session.scheduler.complete(id) && !session.scheduler.is_playing() {
                state.agent_speaking = false;
            }
        }
        self.publish(state);
    }

    fn is_live(&self, state: &ControllerState, epoch: u64) -> bool {
        epoch == self.inner.epoch.current()
            && state.active.as_ref().is_some_and(|session| session.epoch == epoch)
    }

    /// Same teardown as `stop`, triggered from inside dispatch.
    fn fail_locked(&self, state: &mut ControllerState) {
        self.inner.epoch.advance();
        if let Some(ended) = Self::teardown(state) {
            self.inner.observer.connection_lost();
            self.inner.observer.session_ended(ended);
        }
    }

    fn record_failure(&self, epoch: u64, err: &SessionError) {
        let mut guard = self.lock();
        if self.inner.epoch.current() == epoch {
            guard.last_error = Some(err.to_string());
            self.publish(&guard);
        }
    }

    /// Release everything the running session holds. Returns its epoch.
    fn teardown(state: &mut ControllerState) -> Option<u64> {
        let mut session = state.active.take()?;
        session.closer.close();
        session.tracks.stop();
        session.scheduler.close();
        state.agent_speaking = false;
        state.reconciler.discard_pending();
        Some(session.epoch)
    }

    fn publish(&self, state: &ControllerState) {
        let next = SessionView {
            epoch: self.inner.epoch.current(),
            active: state.active.is_some(),
            user_caption: state.reconciler.pending_user().to_string(),
            agent_caption: state.reconciler.pending_agent().to_string(),
            agent_speaking: state.agent_speaking,
            last_error: state.last_error.clone(),
        };
        self.inner.view.send_if_modified(|view| {
            if *view == next {
                false
            } else {
                *view = next;
                true
            }
        });
    }
}

/// Feed service events into the controller until the epoch moves on.
///
/// The service hanging up without a close frame still counts as a close.
async fn pump_events(controller: SessionController, mut events: mpsc::Receiver<LiveEvent>, mut token: EpochToken) {
    let epoch = token.epoch();
    loop {
        tokio::select! {
            biased;
            _ = token.invalidated() => break,
            event = events.recv() => match event {
                Some(event) => controller.dispatch(epoch, event),
                None => {
                    controller.dispatch(epoch, LiveEvent::Closed(None));
                    break;
                }
            },
        }
    }
    debug!(epoch, "Event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{InputStream, OutputDevice};
    use crate::audio::playback::tests::{pcm_chunk, FakeOutput, OutputLog};
    use crate::session::transcript::Speaker;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    struct FakeTracks {
        stopped: Arc<AtomicUsize>,
    }

    impl MediaTracks for FakeTracks {
        fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        deny: bool,
        /// Rate the fake microphone reports instead of the requested one
        input_rate: Option<u32>,
        gate: Option<Arc<Notify>>,
        requests: Arc<AtomicUsize>,
        tracks_stopped: Arc<AtomicUsize>,
        output: Arc<Mutex<OutputLog>>,
        mic: Arc<Mutex<Vec<mpsc::Sender<Vec<f32>>>>>,
    }

    impl AudioBackend for FakeBackend {
        fn open_input(&self, sample_rate: u32) -> BoxFuture<'static, Result<InputStream, SessionError>> {
            let deny = self.deny;
            let input_rate = self.input_rate;
            let gate = self.gate.clone();
            let requests = self.requests.clone();
            let stopped = self.tracks_stopped.clone();
            let mic = self.mic.clone();
            Box::pin(async move {
                requests.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                if deny {
                    return Err(SessionError::Permission("denied".to_string()));
                }
                let (tx, rx) = mpsc::channel(8);
                mic.lock().unwrap().push(tx);
                Ok(InputStream {
                    sample_rate: input_rate.unwrap_or(sample_rate),
                    frames: rx,
                    tracks: Box::new(FakeTracks { stopped }),
                })
            })
        }

        fn open_output(&self, sample_rate: u32, _epoch: u64) -> Result<Box<dyn OutputDevice>, SessionError> {
            Ok(Box::new(FakeOutput {
                sample_rate,
                log: self.output.clone(),
            }))
        }
    }

    /// The service side of one fake connection.
    struct Remote {
        setup: SetupMessage,
        events: mpsc::Sender<LiveEvent>,
        _audio: mpsc::Receiver<crate::audio::capture::EncodedFrame>,
        closed: oneshot::Receiver<()>,
    }

    #[derive(Default)]
    struct FakeTransport {
        fail: bool,
        gate: Option<Arc<Notify>>,
        attempts: Arc<AtomicUsize>,
        remotes: Arc<Mutex<Vec<Remote>>>,
    }

    impl LiveTransport for FakeTransport {
        fn connect(&self, setup: SetupMessage) -> BoxFuture<'static, Result<LiveConnection, SessionError>> {
            let fail = self.fail;
            let gate = self.gate.clone();
            let attempts = self.attempts.clone();
            let remotes = self.remotes.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                if fail {
                    return Err(SessionError::Connection("unreachable".to_string()));
                }
                let (audio_tx, audio_rx) = mpsc::channel(8);
                let (events_tx, events_rx) = mpsc::channel(8);
                let (close_tx, close_rx) = oneshot::channel();
                remotes.lock().unwrap().push(Remote {
                    setup,
                    events: events_tx,
                    _audio: audio_rx,
                    closed: close_rx,
                });
                Ok(LiveConnection {
                    audio: audio_tx,
                    events: events_rx,
                    closer: ConnectionCloser::new(close_tx),
                })
            })
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        turns: AtomicUsize,
        dropped: AtomicUsize,
        lost: AtomicUsize,
    }

    impl SessionObserver for CountingObserver {
        fn turn_committed(&self) {
            self.turns.fetch_add(1, Ordering::SeqCst);
        }
        fn chunk_dropped(&self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        fn connection_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings::from_config(&AppConfig::default())
    }

    fn persona() -> SessionConfig {
        SessionConfig {
            persona: "A demanding client named Sam".to_string(),
            reference_text: "Contract renewal terms".to_string(),
            reference_label: "renewal.docx".to_string(),
        }
    }

    struct Harness {
        controller: SessionController,
        backend: Arc<FakeBackend>,
        remotes: Arc<Mutex<Vec<Remote>>>,
        observer: Arc<CountingObserver>,
    }

    fn harness_with(backend: FakeBackend, transport: FakeTransport) -> Harness {
        let backend = Arc::new(backend);
        let remotes = transport.remotes.clone();
        let observer = Arc::new(CountingObserver::default());
        let controller = SessionController::new(
            backend.clone(),
            Arc::new(transport),
            settings(),
            observer.clone(),
        );
        Harness {
            controller,
            backend,
            remotes,
            observer,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeBackend::default(), FakeTransport::default())
    }

    async fn started(h: &Harness) -> u64 {
        match h.controller.start(persona()).await.unwrap() {
            StartOutcome::Started(epoch) => epoch,
            StartOutcome::Superseded => panic!("start was superseded"),
        }
    }

    #[tokio::test]
    async fn test_start_activates_and_sends_persona() {
        let h = harness();
        let epoch = started(&h).await;

        assert_eq!(epoch, 1);
        let view = h.controller.view().borrow().clone();
        assert!(view.active);
        assert_eq!(view.epoch, 1);

        let remotes = h.remotes.lock().unwrap();
        let setup = &remotes[0].setup.setup;
        assert_eq!(setup.generation_config.response_modalities, vec!["AUDIO"]);
        assert!(setup.system_instruction.parts[0].text.contains("A demanding client named Sam"));
        assert!(setup.system_instruction.parts[0].text.contains("renewal.docx"));
    }

    #[tokio::test]
    async fn test_turn_is_merged_and_committed() {
        let h = harness();
        let mut turns = h.controller.take_turns().unwrap();
        let epoch = started(&h).await;

        h.controller.dispatch(epoch, LiveEvent::InputTranscript("Hello".to_string()));
        h.controller.dispatch(epoch, LiveEvent::InputTranscript("Hello there".to_string()));
        h.controller.dispatch(epoch, LiveEvent::OutputTranscript("Hi".to_string()));
        h.controller.dispatch(epoch, LiveEvent::OutputTranscript(", how can I help?".to_string()));

        let view = h.controller.view().borrow().clone();
        assert_eq!(view.user_caption, "Hello there");
        assert_eq!(view.agent_caption, "Hi, how can I help?");

        h.controller.dispatch(epoch, LiveEvent::TurnComplete);
        let view = h.controller.view().borrow().clone();
        assert!(view.user_caption.is_empty());
        assert!(view.agent_caption.is_empty());

        let turn = turns.try_recv().unwrap();
        assert_eq!(turn.epoch, epoch);
        assert_eq!(turn.segments.len(), 2);
        assert_eq!(turn.segments[0].speaker, Speaker::User);
        assert_eq!(turn.segments[0].text, "Hello there");
        assert_eq!(turn.segments[1].text, "Hi, how can I help?");
        assert_eq!(h.observer.turns.load(Ordering::SeqCst), 1);

        // The same pair again commits nothing and publishes nothing
        h.controller.dispatch(epoch, LiveEvent::InputTranscript("Hello there".to_string()));
        h.controller.dispatch(epoch, LiveEvent::OutputTranscript("Hi, how can I help?".to_string()));
        h.controller.dispatch(epoch, LiveEvent::TurnComplete);
        assert!(turns.try_recv().is_err());
        assert!(h.controller.take_turns().is_none());
    }

    #[tokio::test]
    async fn test_audio_schedules_back_to_back_and_clears_speaking() {
        let h = harness();
        let epoch = started(&h).await;
        h.backend.output.lock().unwrap().now = 2.0;

        h.controller.dispatch(epoch, LiveEvent::Audio(pcm_chunk(0.5)));
        h.controller.dispatch(epoch, LiveEvent::Audio(pcm_chunk(0.3)));
        assert!(h.controller.view().borrow().agent_speaking);

        let started_at: Vec<f64> = h.backend.output.lock().unwrap().started.iter().map(|s| s.1).collect();
        assert_eq!(started_at, vec![2.0, 2.5]);

        h.controller.playback_finished(epoch, 1);
        assert!(h.controller.view().borrow().agent_speaking);
        h.controller.playback_finished(epoch, 2);
        assert!(!h.controller.view().borrow().agent_speaking);
    }

    #[tokio::test]
    async fn test_undecodable_chunk_is_dropped() {
        let h = harness();
        let epoch = started(&h).await;

        h.controller.dispatch(epoch, LiveEvent::Audio(vec![1, 2, 3]));
        assert!(h.controller.is_active());
        assert!(h.backend.output.lock().unwrap().started.is_empty());
        assert_eq!(h.observer.dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interruption_flushes_and_discards_agent_text() {
        let h = harness();
        let mut turns = h.controller.take_turns().unwrap();
        let epoch = started(&h).await;

        h.controller.dispatch(epoch, LiveEvent::InputTranscript("Wait".to_string()));
        h.controller.dispatch(epoch, LiveEvent::OutputTranscript("As I was say".to_string()));
        h.controller.dispatch(epoch, LiveEvent::Audio(pcm_chunk(0.5)));
        h.controller.dispatch(epoch, LiveEvent::Audio(pcm_chunk(0.5)));

        h.controller.dispatch(epoch, LiveEvent::Interrupted);
        let view = h.controller.view().borrow().clone();
        assert!(!view.agent_speaking);
        assert!(view.agent_caption.is_empty());
        assert_eq!(view.user_caption, "Wait");
        assert_eq!(h.backend.output.lock().unwrap().stopped, vec![1, 2]);

        h.controller.dispatch(epoch, LiveEvent::TurnComplete);
        let turn = turns.try_recv().unwrap();
        assert_eq!(turn.segments.len(), 1);
        assert_eq!(turn.segments[0].speaker, Speaker::User);
    }

    #[tokio::test]
    async fn test_stop_releases_everything_and_drops_stale_events() {
        let h = harness();
        let epoch = started(&h).await;
        h.controller.dispatch(epoch, LiveEvent::Audio(pcm_chunk(0.2)));

        h.controller.stop();
        assert!(!h.controller.is_active());
        assert_eq!(h.backend.tracks_stopped.load(Ordering::SeqCst), 1);
        assert!(h.remotes.lock().unwrap()[0].closed.try_recv().is_ok());
        {
            let log = h.backend.output.lock().unwrap();
            assert_eq!(log.stopped, vec![1]);
            assert!(log.closed);
        }

        let before = h.controller.view().borrow().clone();
        h.controller.dispatch(epoch, LiveEvent::InputTranscript("late".to_string()));
        h.controller.playback_finished(epoch, 1);
        assert_eq!(*h.controller.view().borrow(), before);

        // Idempotent, and invisible to view subscribers
        let mut view = h.controller.view();
        view.borrow_and_update();
        h.controller.stop();
        assert_eq!(h.backend.tracks_stopped.load(Ordering::SeqCst), 1);
        assert!(!view.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_permission_denied_leaves_session_inactive() {
        let h = harness_with(
            FakeBackend {
                deny: true,
                ..Default::default()
            },
            FakeTransport::default(),
        );

        let result = h.controller.start(persona()).await;
        assert!(matches!(result, Err(SessionError::Permission(_))));
        assert!(!h.controller.is_active());
        assert!(h.remotes.lock().unwrap().is_empty());
        assert!(h.controller.view().borrow().last_error.is_some());
    }

    #[tokio::test]
    async fn test_connection_failure_releases_devices() {
        let h = harness_with(
            FakeBackend::default(),
            FakeTransport {
                fail: true,
                ..Default::default()
            },
        );

        let result = h.controller.start(persona()).await;
        assert!(matches!(result, Err(SessionError::Connection(_))));
        assert!(!h.controller.is_active());
        assert_eq!(h.backend.tracks_stopped.load(Ordering::SeqCst), 1);
        assert!(h.backend.output.lock().unwrap().closed);
    }

    #[tokio::test]
    async fn test_stop_during_acquisition_supersedes_start() {
        let gate = Arc::new(Notify::new());
        let h = harness_with(
            FakeBackend {
                gate: Some(gate.clone()),
                ..Default::default()
            },
            FakeTransport::default(),
        );

        let controller = h.controller.clone();
        let pending = tokio::spawn(async move { controller.start(persona()).await });
        while h.backend.requests.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        h.controller.stop();
        gate.notify_one();

        assert_eq!(pending.await.unwrap().unwrap(), StartOutcome::Superseded);
        assert!(!h.controller.is_active());
        assert_eq!(h.backend.tracks_stopped.load(Ordering::SeqCst), 1);
        assert!(h.backend.output.lock().unwrap().closed);
        assert!(h.remotes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_tears_down_previous_session() {
        let h = harness();
        let first = started(&h).await;
        let second = started(&h).await;

        assert!(second > first);
        assert!(h.controller.is_active());
        let mut remotes = h.remotes.lock().unwrap();
        assert_eq!(remotes.len(), 2);
        assert!(remotes[0].closed.try_recv().is_ok());
        assert!(remotes[1].closed.try_recv().is_err());
        drop(remotes);

        // Events from the first connection no longer land
        h.controller.dispatch(first, LiveEvent::InputTranscript("old".to_string()));
        assert!(h.controller.view().borrow().user_caption.is_empty());
    }

    #[tokio::test]
    async fn test_error_event_tears_down_like_stop() {
        let h = harness();
        let epoch = started(&h).await;

        h.controller.dispatch(epoch, LiveEvent::Error("socket reset".to_string()));
        let view = h.controller.view().borrow().clone();
        assert!(!view.active);
        assert_eq!(view.last_error.as_deref(), Some("socket reset"));
        assert_eq!(h.backend.tracks_stopped.load(Ordering::SeqCst), 1);
        assert_eq!(h.observer.lost.load(Ordering::SeqCst), 1);
        assert!(h.remotes.lock().unwrap()[0].closed.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_events_flow_through_the_pump() {
        let h = harness();
        started(&h).await;
        let events = h.remotes.lock().unwrap()[0].events.clone();
        let mut view = h.controller.view();

        events.send(LiveEvent::InputTranscript("Good morning".to_string())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), view.wait_for(|v| v.user_caption == "Good morning"))
            .await
            .unwrap()
            .unwrap();

        events.send(LiveEvent::Closed(None)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), view.wait_for(|v| !v.active))
            .await
            .unwrap()
            .unwrap();
        assert!(h.controller.view().borrow().last_error.is_none());
    }

    #[tokio::test]
    async fn test_end_returns_transcript_in_commit_order() {
        let h = harness();
        let epoch = started(&h).await;
        for (user, agent) in [("One", "Two"), ("Three", "Four")] {
            h.controller.dispatch(epoch, LiveEvent::InputTranscript(user.to_string()));
            h.controller.dispatch(epoch, LiveEvent::OutputTranscript(agent.to_string()));
            h.controller.dispatch(epoch, LiveEvent::TurnComplete);
        }

        let transcript = h.controller.end();
        let texts: Vec<&str> = transcript.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["One", "Two", "Three", "Four"]);
        assert!(!h.controller.is_active());
        assert!(h.controller.end().is_empty());
    }

    #[tokio::test]
    async fn test_stop_during_handshake_closes_fresh_connection() {
        let gate = Arc::new(Notify::new());
        let transport = FakeTransport {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let attempts = transport.attempts.clone();
        let h = harness_with(FakeBackend::default(), transport);

        let controller = h.controller.clone();
        let pending = tokio::spawn(async move { controller.start(persona()).await });
        while attempts.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        h.controller.stop();
        gate.notify_one();

        assert_eq!(pending.await.unwrap().unwrap(), StartOutcome::Superseded);
        assert!(!h.controller.is_active());
        let mut remotes = h.remotes.lock().unwrap();
        assert_eq!(remotes.len(), 1);
        assert!(remotes[0].closed.try_recv().is_ok());
        drop(remotes);
        assert_eq!(h.backend.tracks_stopped.load(Ordering::SeqCst), 1);
        assert!(h.backend.output.lock().unwrap().closed);
    }

    #[tokio::test]
    async fn test_unusable_microphone_rate_fails_start() {
        let h = harness_with(
            FakeBackend {
                input_rate: Some(0),
                ..Default::default()
            },
            FakeTransport::default(),
        );

        let result = h.controller.start(persona()).await;
        assert!(matches!(result, Err(SessionError::Device(_))));
        assert!(!h.controller.is_active());
        assert_eq!(h.backend.tracks_stopped.load(Ordering::SeqCst), 1);
        assert!(h.remotes.lock().unwrap().is_empty());
        assert!(h.controller.view().borrow().last_error.is_some());
    }

    #[tokio::test]
    async fn test_resampled_microphone_starts() {
        let h = harness_with(
            FakeBackend {
                input_rate: Some(48000),
                ..Default::default()
            },
            FakeTransport::default(),
        );
        started(&h).await;
        assert!(h.controller.is_active());
    }
}
