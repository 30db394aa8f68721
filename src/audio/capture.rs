//! # Audio Capture Pipeline
//!
//! Turns the microphone's float samples into the frames the speech service expects:
//!
//! 1. **Resample** to the wire rate (16 kHz) if the microphone runs at another rate
//! 2. **Re-block** into fixed-size frames (4096 samples by default)
//! 3. **Convert** f32 in [-1.0, 1.0] to 16-bit signed PCM, little-endian
//! 4. **Encode** as base64 with the `audio/pcm;rate=16000` mime type
//!
//! The pipeline runs as one task for the whole session and ends when the microphone
//! tracks stop, the connection goes away, or the session epoch is invalidated.

use crate::error::SessionError;
use crate::session::epoch::EpochToken;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{LittleEndian, WriteBytesExt};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One outbound microphone frame, ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    /// Base64 of little-endian 16-bit PCM
    pub data: String,
    pub mime_type: String,
    pub sample_count: usize,
}

/// Convert float samples to 16-bit PCM bytes (little-endian).
///
/// ## Conversion:
/// Scales [-1.0, 1.0] to [-32768, 32767]; anything outside is clamped instead of
/// wrapping around.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(scaled);
    }
    bytes
}

/// Encode one block of samples as a wire frame.
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> EncodedFrame {
    EncodedFrame {
        data: BASE64.encode(encode_pcm16(samples)),
        mime_type: format!("audio/pcm;rate={}", sample_rate),
        sample_count: samples.len(),
    }
}

/// Input chunk handed to the FFT resampler per call.
const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Highest microphone rate accepted from a capture device.
pub const MAX_SOURCE_RATE: u32 = 192_000;

/// Reject capture rates no microphone produces.
pub fn check_source_rate(rate: u32) -> Result<u32, SessionError> {
    if rate == 0 || rate > MAX_SOURCE_RATE {
        return Err(SessionError::Device(format!(
            "Unsupported microphone sample rate {} Hz",
            rate
        )));
    }
    Ok(rate)
}

/// Resamples microphone input to the wire rate and re-blocks it into fixed frames.
///
/// Resampling goes through `rubato`'s `FftFixedIn` in chunks of
/// [`RESAMPLER_CHUNK_SIZE`] samples. At the wire rate samples go straight to framing.
pub struct FrameResampler {
    resampler: Option<FftFixedIn<f32>>,
    in_buf: Vec<f32>,
    out_rate: u32,
    block_size: usize,
    pending: Vec<f32>,
}

impl FrameResampler {
    pub fn new(in_hz: u32, out_hz: u32, block_size: usize) -> Result<Self, SessionError> {
        check_source_rate(in_hz)?;
        if out_hz == 0 || block_size == 0 {
            return Err(SessionError::Config(
                "Capture rate and block size must be greater than 0".to_string(),
            ));
        }

        let resampler = if in_hz != out_hz {
            let resampler = FftFixedIn::<f32>::new(in_hz as usize, out_hz as usize, RESAMPLER_CHUNK_SIZE, 1, 1)
                .map_err(|e| SessionError::Device(format!("Failed to create resampler: {}", e)))?;
            Some(resampler)
        } else {
            None
        };

        Ok(Self {
            resampler,
            in_buf: Vec::with_capacity(RESAMPLER_CHUNK_SIZE),
            out_rate: out_hz,
            block_size,
            pending: Vec::with_capacity(block_size),
        })
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    /// Rate of the blocks this produces.
    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    /// Add samples; returns every block that is now complete.
    pub fn push(&mut self, mut src: &[f32]) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        let Some(resampler) = self.resampler.as_mut() else {
            fill_blocks(&mut self.pending, self.block_size, src, &mut blocks);
            return blocks;
        };

        while !src.is_empty() {
            let take = (RESAMPLER_CHUNK_SIZE - self.in_buf.len()).min(src.len());
            self.in_buf.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.in_buf.len() == RESAMPLER_CHUNK_SIZE {
                match resampler.process(&[&self.in_buf[..]], None) {
                    Ok(out) => fill_blocks(&mut self.pending, self.block_size, &out[0], &mut blocks),
                    Err(e) => warn!("Resampler rejected a microphone chunk: {}", e),
                }
                self.in_buf.clear();
            }
        }
        blocks
    }

    /// Output samples waiting for a block to fill.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn fill_blocks(pending: &mut Vec<f32>, block_size: usize, mut data: &[f32], blocks: &mut Vec<Vec<f32>>) {
    while !data.is_empty() {
        let take = (block_size - pending.len()).min(data.len());
        pending.extend_from_slice(&data[..take]);
        data = &data[take..];
        if pending.len() == block_size {
            blocks.push(std::mem::replace(pending, Vec::with_capacity(block_size)));
        }
    }
}

/// Run the capture pipeline until the microphone or the connection ends, or the
/// session epoch moves on.
///
/// Returns the number of frames sent.
pub async fn run_capture(
    mut frames: mpsc::Receiver<Vec<f32>>,
    mut framer: FrameResampler,
    outbound: mpsc::Sender<EncodedFrame>,
    mut token: EpochToken,
) -> u64 {
    let epoch = token.epoch();
    let live = token.clone();
    let rate = framer.out_rate();
    let mut sent = 0u64;

    if framer.is_resampling() {
        info!(epoch, target_rate = rate, "Resampling microphone input");
    }

    'capture: loop {
        tokio::select! {
            biased;
            _ = token.invalidated() => {
                debug!(epoch, "Capture stopped by epoch change");
                break;
            }
            batch = frames.recv() => {
                let Some(samples) = batch else {
                    debug!(epoch, "Microphone tracks ended");
                    break;
                };
                for block in framer.push(&samples) {
                    if !live.is_current() {
                        break 'capture;
                    }
                    if outbound.send(encode_frame(&block, rate)).await.is_err() {
                        debug!(epoch, "Connection closed, capture stopping");
                        break 'capture;
                    }
                    sent += 1;
                }
            }
        }
    }

    info!(epoch, frames_sent = sent, "Capture pipeline finished");
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::epoch::EpochCounter;
    use byteorder::ReadBytesExt;
    use std::io::Cursor;

    fn decode(frame: &EncodedFrame) -> Vec<i16> {
        let bytes = BASE64.decode(&frame.data).unwrap();
        let mut cursor = Cursor::new(bytes);
        let mut out = Vec::new();
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            out.push(sample);
        }
        out
    }

    #[test]
    fn test_encode_pcm16_scales_and_clamps() {
        let bytes = encode_pcm16(&[0.0, 0.5, -0.5, 1.0, -1.0, 1.7, -3.0]);
        let mut cursor = Cursor::new(bytes);
        let mut samples = Vec::new();
        while let Ok(s) = cursor.read_i16::<LittleEndian>() {
            samples.push(s);
        }
        assert_eq!(samples, vec![0, 16384, -16384, 32767, -32768, 32767, -32768]);
    }

    #[test]
    fn test_encode_frame_metadata() {
        let frame = encode_frame(&[0.25; 8], 16000);
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        assert_eq!(frame.sample_count, 8);
        assert_eq!(decode(&frame), vec![8192; 8]);
    }

    #[test]
    fn test_wire_rate_input_is_only_reblocked() {
        let mut framer = FrameResampler::new(16000, 16000, 4).unwrap();
        assert!(!framer.is_resampling());
        assert!(framer.push(&[0.0; 3]).is_empty());
        let blocks = framer.push(&[1.0; 6]);
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len() == 4));
        assert_eq!(blocks[0], vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(framer.pending_len(), 1);
    }

    #[test]
    fn test_downsampled_input_comes_out_in_fixed_blocks() {
        let mut framer = FrameResampler::new(48000, 16000, 1600).unwrap();
        assert!(framer.is_resampling());

        let mut blocks = Vec::new();
        for _ in 0..10 {
            blocks.extend(framer.push(&[0.0; 4800]));
        }
        // One second in, roughly one second out, minus what is still buffered
        assert!(blocks.len() >= 8, "got {} blocks", blocks.len());
        assert!(blocks.len() <= 10);
        assert!(blocks.iter().all(|b| b.len() == 1600));
        assert!(blocks.iter().flatten().all(|s| *s == 0.0));
    }

    #[test]
    fn test_unusable_source_rates_are_rejected() {
        assert!(matches!(FrameResampler::new(0, 16000, 4096), Err(SessionError::Device(_))));
        assert!(matches!(
            FrameResampler::new(MAX_SOURCE_RATE + 1, 16000, 4096),
            Err(SessionError::Device(_))
        ));
        assert!(matches!(FrameResampler::new(48000, 16000, 0), Err(SessionError::Config(_))));
        assert_eq!(check_source_rate(44100).unwrap(), 44100);
    }

    #[tokio::test]
    async fn test_run_capture_frames_until_tracks_stop() {
        let counter = EpochCounter::new();
        counter.advance();
        let (mic_tx, mic_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let framer = FrameResampler::new(16000, 16000, 4).unwrap();

        let task = tokio::spawn(run_capture(mic_rx, framer, out_tx, counter.token()));
        mic_tx.send(vec![0.5; 6]).await.unwrap();
        mic_tx.send(vec![0.5; 2]).await.unwrap();
        drop(mic_tx);

        assert_eq!(task.await.unwrap(), 2);
        let first = out_rx.recv().await.unwrap();
        assert_eq!(decode(&first), vec![16384; 4]);
        assert!(out_rx.recv().await.is_some());
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_capture_stops_on_epoch_change() {
        let counter = EpochCounter::new();
        counter.advance();
        let (_mic_tx, mic_rx) = mpsc::channel::<Vec<f32>>(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let framer = FrameResampler::new(16000, 16000, 4).unwrap();

        let task = tokio::spawn(run_capture(mic_rx, framer, out_tx, counter.token()));
        counter.advance();
        let sent = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("capture should stop when the epoch moves")
            .unwrap();
        assert_eq!(sent, 0);
    }
}
