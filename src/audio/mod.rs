//! # Audio Module
//!
//! Everything between the session controller and the sound hardware.
//!
//! ## Key Components:
//! - **Device**: traits for the microphone stream and the playback device
//! - **Capture**: resample, re-block and encode microphone audio for the wire
//! - **Playback**: decode agent audio and schedule it gaplessly on the output clock
//! - **Relay**: device implementation backed by a browser over the session socket
//!
//! ## Audio Formats:
//! - **Input (to the service)**: 16 kHz, 16-bit PCM, mono, little-endian, base64
//! - **Output (from the service)**: 24 kHz, 16-bit PCM, mono, little-endian

pub mod capture; // Microphone → wire frames
pub mod device; // Audio endpoint traits
pub mod playback; // Wire chunks → output timeline
pub mod relay; // Browser-backed endpoints
