//! # Playback Scheduling
//!
//! Agent audio arrives as a stream of small PCM chunks. Each chunk is decoded and
//! scheduled on the output device so that it starts exactly where the previous one
//! ends, giving gapless speech as long as chunks arrive faster than they play.
//! An interruption flushes everything at once.
//!
//! ## Scheduling Rule:
//! `start = max(next_start_at, clock.now)`, then `next_start_at = start + duration`.
//! The `max` keeps us from scheduling in the past after the queue has drained; the
//! advance packs chunks back-to-back while it has not.

use crate::audio::device::OutputDevice;
use crate::error::SessionError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::io::Cursor;

/// Convert 16-bit little-endian PCM bytes to f32 samples in [-1.0, 1.0].
///
/// ## Errors:
/// An empty payload or an odd number of bytes cannot be 16-bit PCM.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, SessionError> {
    if bytes.is_empty() {
        return Err(SessionError::Decode("Audio chunk is empty".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Decode(format!(
            "Audio chunk length {} is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// A decoded chunk that has been placed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: u64,
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Gapless sequential playback with hard interruption.
pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    /// Output-clock time at which the next chunk starts. Zero means "not anchored".
    next_start_at: f64,
    /// Scheduled or sounding buffers, by id.
    live: BTreeMap<u64, ScheduledChunk>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            device,
            next_start_at: 0.0,
            live: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Decode a chunk and schedule it right after everything already queued.
    ///
    /// A chunk that fails to decode is rejected without touching the schedule.
    pub fn enqueue(&mut self, chunk: &[u8]) -> Result<ScheduledChunk, SessionError> {
        let samples = decode_pcm16(chunk)?;
        let duration = samples.len() as f64 / self.device.sample_rate() as f64;

        self.next_start_at = self.next_start_at.max(self.device.current_time());

        let scheduled = ScheduledChunk {
            id: self.next_id,
            start_at: self.next_start_at,
            duration,
        };
        self.next_id += 1;

        self.device.start(scheduled.id, scheduled.start_at, &samples);
        self.next_start_at += duration;
        self.live.insert(scheduled.id, scheduled);

        Ok(scheduled)
    }

    /// Natural end of a buffer. Returns false if the id was not live (already
    /// flushed, or never scheduled).
    pub fn complete(&mut self, id: u64) -> bool {
        self.live.remove(&id).is_some()
    }

    /// Stop everything immediately and forget the timeline.
    ///
    /// Returns the ids that were stopped. The next [`enqueue`](Self::enqueue)
    /// anchors to the output clock at that moment.
    pub fn flush(&mut self) -> Vec<u64> {
        let stopped: Vec<u64> = self.live.keys().copied().collect();
        for id in &stopped {
            self.device.stop(*id);
        }
        self.live.clear();
        self.next_start_at = 0.0;
        stopped
    }

    /// Flush and release the output device.
    pub fn close(&mut self) {
        self.flush();
        self.device.close();
    }

    pub fn is_playing(&self) -> bool {
        !self.live.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn next_start_at(&self) -> f64 {
        self.next_start_at
    }
}
