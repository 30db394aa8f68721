//! # Browser Relay Backend
//!
//! [`AudioBackend`] implementation for sessions whose microphone and speakers live in
//! a browser tab on the other end of the `/ws/session` socket.
//!
//! ## Flow:
//! - The controller asks for the microphone → a [`RelayCommand::RequestMicrophone`]
//!   goes out and the future parks until the browser answers with `microphone`
//! - Binary frames from the browser are pushed into the open input stream
//! - Playback calls on the output device become `play` / `stop_playback` messages,
//!   stamped with the session epoch so stale `playback_ended` replies can be told apart
//!
//! ## Output Clock:
//! The relay output clock starts at zero when the output is opened. The browser
//! anchors its own audio context at the matching `open_output` message and plays each
//! buffer at `anchor + start_at`.

use crate::audio::capture::check_source_rate;
use crate::audio::device::{AudioBackend, InputStream, MediaTracks, OutputDevice};
use crate::error::SessionError;
use byteorder::{LittleEndian, ReadBytesExt};
use futures_util::future::BoxFuture;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Batches of microphone samples buffered between the socket and the capture task.
const FRAME_QUEUE: usize = 64;

/// Instructions for the browser, drained by the socket actor.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayCommand {
    RequestMicrophone { sample_rate: u32 },
    StopMicrophone,
    OpenOutput { epoch: u64, sample_rate: u32 },
    Play {
        epoch: u64,
        id: u64,
        start_at: f64,
        sample_rate: u32,
        samples: Vec<f32>,
    },
    StopPlayback { epoch: u64, ids: Vec<u64> },
    CloseOutput { epoch: u64 },
}

/// The browser's reply to a microphone request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicrophoneAnswer {
    pub granted: bool,
    /// Rate the browser will actually capture at, if it differs from the request
    pub sample_rate: Option<u32>,
}

struct RelayInner {
    commands: mpsc::UnboundedSender<RelayCommand>,
    pending_permission: Mutex<Option<oneshot::Sender<MicrophoneAnswer>>>,
    /// Open microphone stream, tagged with the grant that opened it
    frames: Mutex<Option<(u64, mpsc::Sender<Vec<f32>>)>>,
    grants: Mutex<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Audio backend that relays everything over the browser socket.
#[derive(Clone)]
pub struct RelayBackend {
    inner: Arc<RelayInner>,
}

impl RelayBackend {
    /// Create the backend and the command stream the socket actor forwards to the browser.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let backend = Self {
            inner: Arc::new(RelayInner {
                commands,
                pending_permission: Mutex::new(None),
                frames: Mutex::new(None),
                grants: Mutex::new(0),
            }),
        };
        (backend, rx)
    }

    /// Deliver the browser's answer to the outstanding microphone request.
    ///
    /// Returns false when nothing was waiting (a late or duplicate answer).
    pub fn resolve_permission(&self, answer: MicrophoneAnswer) -> bool {
        match lock(&self.inner.pending_permission).take() {
            Some(tx) => tx.send(answer).is_ok(),
            None => {
                debug!("Microphone answer with no pending request");
                false
            }
        }
    }

    /// Feed microphone samples from the browser into the open input stream.
    ///
    /// Samples are dropped when no stream is open or the capture task is behind.
    pub fn push_samples(&self, samples: Vec<f32>) {
        let mut slot = lock(&self.inner.frames);
        let Some((_, tx)) = slot.as_ref() else {
            return;
        };
        match tx.try_send(samples) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Capture pipeline is behind, dropping microphone samples");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *slot = None;
            }
        }
    }
}

impl AudioBackend for RelayBackend {
    fn open_input(&self, sample_rate: u32) -> BoxFuture<'static, Result<InputStream, SessionError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            // A newer request supersedes an unanswered one
            *lock(&inner.pending_permission) = Some(tx);
            inner
                .commands
                .send(RelayCommand::RequestMicrophone { sample_rate })
                .map_err(|_| SessionError::Device("Browser connection is closed".to_string()))?;

            let answer = rx
                .await
                .map_err(|_| SessionError::Device("Microphone request was abandoned".to_string()))?;
            if !answer.granted {
                return Err(SessionError::Permission("Microphone access was denied".to_string()));
            }
            let source_rate = match check_source_rate(answer.sample_rate.unwrap_or(sample_rate)) {
                Ok(rate) => rate,
                Err(e) => {
                    // The browser already opened its microphone
                    let _ = inner.commands.send(RelayCommand::StopMicrophone);
                    return Err(e);
                }
            };

            let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
            let grant = {
                let mut grants = lock(&inner.grants);
                *grants += 1;
                *grants
            };
            *lock(&inner.frames) = Some((grant, frames_tx));

            Ok(InputStream {
                sample_rate: source_rate,
                frames: frames_rx,
                tracks: Box::new(RelayTracks { inner, grant }),
            })
        })
    }

    fn open_output(&self, sample_rate: u32, epoch: u64) -> Result<Box<dyn OutputDevice>, SessionError> {
        self.inner
            .commands
            .send(RelayCommand::OpenOutput { epoch, sample_rate })
            .map_err(|_| SessionError::Device("Browser connection is closed".to_string()))?;
        Ok(Box::new(RelayOutput {
            epoch,
            sample_rate,
            opened: Instant::now(),
            commands: self.inner.commands.clone(),
            closed: false,
        }))
    }
}

struct RelayTracks {
    inner: Arc<RelayInner>,
    grant: u64,
}

impl MediaTracks for RelayTracks {
    fn stop(&mut self) {
        let mut slot = lock(&self.inner.frames);
        // Only close the stream this grant opened
        if matches!(slot.as_ref(), Some((grant, _)) if *grant == self.grant) {
            *slot = None;
            let _ = self.inner.commands.send(RelayCommand::StopMicrophone);
        }
    }
}

struct RelayOutput {
    epoch: u64,
    sample_rate: u32,
    opened: Instant,
    commands: mpsc::UnboundedSender<RelayCommand>,
    closed: bool,
}

impl RelayOutput {
    fn send(&self, command: RelayCommand) {
        if self.closed {
            return;
        }
        if self.commands.send(command).is_err() {
            debug!(epoch = self.epoch, "Browser gone, dropping playback command");
        }
    }
}

impl OutputDevice for RelayOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.opened.elapsed().as_secs_f64()
    }

    fn start(&mut self, id: u64, start_at: f64, samples: &[f32]) {
        self.send(RelayCommand::Play {
            epoch: self.epoch,
            id,
            start_at,
            sample_rate: self.sample_rate,
            samples: samples.to_vec(),
        });
    }

    fn stop(&mut self, id: u64) {
        self.send(RelayCommand::StopPlayback {
            epoch: self.epoch,
            ids: vec![id],
        });
    }

    fn close(&mut self) {
        self.send(RelayCommand::CloseOutput { epoch: self.epoch });
        self.closed = true;
    }
}

/// Decode a binary socket frame of little-endian f32 samples.
pub fn decode_f32_samples(bytes: &[u8]) -> Result<Vec<f32>, SessionError> {
    if bytes.len() % 4 != 0 {
        return Err(SessionError::Decode(format!(
            "Microphone frame length {} is not a whole number of f32 samples",
            bytes.len()
        )));
    }
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_input_waits_for_grant() {
        let (backend, mut commands) = RelayBackend::new();
        let pending = backend.open_input(16000);
        let task = tokio::spawn(pending);

        assert_eq!(
            commands.recv().await,
            Some(RelayCommand::RequestMicrophone { sample_rate: 16000 })
        );
        assert!(backend.resolve_permission(MicrophoneAnswer {
            granted: true,
            sample_rate: Some(48000),
        }));

        let mut input = task.await.unwrap().unwrap();
        assert_eq!(input.sample_rate, 48000);

        backend.push_samples(vec![0.1, 0.2]);
        assert_eq!(input.frames.recv().await, Some(vec![0.1, 0.2]));

        input.tracks.stop();
        assert_eq!(commands.recv().await, Some(RelayCommand::StopMicrophone));
        assert_eq!(input.frames.recv().await, None);
    }

    #[tokio::test]
    async fn test_denied_microphone_is_permission_error() {
        let (backend, mut commands) = RelayBackend::new();
        let task = tokio::spawn(backend.open_input(16000));
        commands.recv().await.unwrap();
        backend.resolve_permission(MicrophoneAnswer {
            granted: false,
            sample_rate: None,
        });
        assert!(matches!(task.await.unwrap(), Err(SessionError::Permission(_))));
    }

    #[tokio::test]
    async fn test_unusable_capture_rate_is_device_error() {
        let (backend, mut commands) = RelayBackend::new();
        let task = tokio::spawn(backend.open_input(16000));
        commands.recv().await.unwrap();
        backend.resolve_permission(MicrophoneAnswer {
            granted: true,
            sample_rate: Some(0),
        });

        assert!(matches!(task.await.unwrap(), Err(SessionError::Device(_))));
        assert_eq!(commands.recv().await, Some(RelayCommand::StopMicrophone));
        // Nothing is open for samples to land in
        backend.push_samples(vec![0.1]);
    }

    #[test]
    fn test_late_answer_is_ignored() {
        let (backend, _commands) = RelayBackend::new();
        assert!(!backend.resolve_permission(MicrophoneAnswer {
            granted: true,
            sample_rate: None,
        }));
    }

    #[tokio::test]
    async fn test_stale_tracks_do_not_close_newer_stream() {
        let (backend, mut commands) = RelayBackend::new();
        let answer = MicrophoneAnswer {
            granted: true,
            sample_rate: None,
        };

        let first = tokio::spawn(backend.open_input(16000));
        commands.recv().await.unwrap();
        backend.resolve_permission(answer);
        let mut old = first.await.unwrap().unwrap();

        let second = tokio::spawn(backend.open_input(16000));
        commands.recv().await.unwrap();
        backend.resolve_permission(answer);
        let mut new = second.await.unwrap().unwrap();

        old.tracks.stop();
        backend.push_samples(vec![0.5]);
        assert_eq!(new.frames.recv().await, Some(vec![0.5]));
    }

    #[test]
    fn test_output_commands_carry_epoch() {
        let (backend, mut commands) = RelayBackend::new();
        let mut output = backend.open_output(24000, 7).unwrap();
        assert_eq!(
            commands.try_recv().unwrap(),
            RelayCommand::OpenOutput {
                epoch: 7,
                sample_rate: 24000
            }
        );

        output.start(1, 0.25, &[0.0, 0.5]);
        output.stop(1);
        output.close();
        output.start(2, 1.0, &[0.0]);

        assert_eq!(
            commands.try_recv().unwrap(),
            RelayCommand::Play {
                epoch: 7,
                id: 1,
                start_at: 0.25,
                sample_rate: 24000,
                samples: vec![0.0, 0.5],
            }
        );
        assert_eq!(
            commands.try_recv().unwrap(),
            RelayCommand::StopPlayback { epoch: 7, ids: vec![1] }
        );
        assert_eq!(commands.try_recv().unwrap(), RelayCommand::CloseOutput { epoch: 7 });
        assert!(commands.try_recv().is_err());
        assert!(output.current_time() >= 0.0);
    }

    #[test]
    fn test_decode_f32_samples() {
        let mut bytes = Vec::new();
        for sample in [0.0f32, -0.5, 1.0] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        assert_eq!(decode_f32_samples(&bytes).unwrap(), vec![0.0, -0.5, 1.0]);
        assert!(decode_f32_samples(&[0, 1, 2]).is_err());
    }
}
