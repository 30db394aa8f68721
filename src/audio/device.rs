//! # Audio Devices
//!
//! The seam between a session and the hardware (or whatever stands in for it). A
//! session owns exactly two audio endpoints, each with its own clock:
//!
//! - an **input stream** delivering microphone samples at the input rate (16 kHz)
//! - an **output device** playing agent audio at the output rate (24 kHz)
//!
//! The two clocks are never assumed to agree with each other or with wall time. The
//! playback scheduler only ever compares output-device times with output-device times.

use crate::error::SessionError;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

/// Control over the microphone tracks behind an [`InputStream`].
pub trait MediaTracks: Send {
    /// Stop capturing. After this the frame channel closes and the capture
    /// pipeline ends on its own.
    fn stop(&mut self);
}

/// A live microphone stream.
///
/// ## Fields:
/// - `sample_rate`: rate the samples actually arrive at
/// - `frames`: f32 samples in [-1.0, 1.0], in arbitrary-sized batches
/// - `tracks`: handle used to stop the microphone on teardown
pub struct InputStream {
    pub sample_rate: u32,
    pub frames: mpsc::Receiver<Vec<f32>>,
    pub tracks: Box<dyn MediaTracks>,
}

/// A playback device with its own monotonic clock.
///
/// Buffers are identified by the ids the playback scheduler hands out. The device
/// reports natural completion back through the session controller
/// (`SessionController::playback_finished`).
pub trait OutputDevice: Send {
    fn sample_rate(&self) -> u32;

    /// Seconds on this device's clock.
    fn current_time(&self) -> f64;

    /// Schedule `samples` (mono, at `sample_rate`) to start at `start_at` seconds.
    fn start(&mut self, id: u64, start_at: f64, samples: &[f32]);

    /// Stop a scheduled or sounding buffer immediately.
    fn stop(&mut self, id: u64);

    /// Release the device. Nothing may be scheduled afterwards.
    fn close(&mut self);
}

/// Factory for the audio endpoints of one session.
///
/// ## Why a boxed future:
/// Microphone access is asynchronous (the user may take a while to answer a
/// permission prompt). The future owns everything it needs (`'static`) so the
/// controller can await it without holding any lock.
pub trait AudioBackend: Send + Sync {
    /// Ask for the microphone. Fails with [`SessionError::Permission`] when the user
    /// refuses.
    fn open_input(&self, sample_rate: u32) -> BoxFuture<'static, Result<InputStream, SessionError>>;

    /// Open the playback device for the session running under `epoch`.
    fn open_output(&self, sample_rate: u32, epoch: u64) -> Result<Box<dyn OutputDevice>, SessionError>;
}
