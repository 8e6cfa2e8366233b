//! # Mic Relay
//!
//! Real-time microphone to speaker relay with Bluetooth hands-free support.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                  Relay Controller (relay::controller)                │
//! │        start(mode) / stop()  ──▶  worker thread  ──▶  RelayEvent     │
//! └───────┬───────────────────────────┬───────────────────────────┬──────┘
//!         │ Bluetooth mode only       │                           │
//!         ▼                           ▼                           ▼
//! ┌────────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │  Link Negotiator   │   │    Audio Source     │   │     Audio Sink      │
//! │ (bluetooth::nego-  │   │  (audio::capture)   │   │  (audio::playback)  │
//! │  tiator)           │   │                     │   │                     │
//! │  request_link ─┐   │   │  cpal input stream  │   │  chunk queue        │
//! │                ▼   │   │        │            │   │        │            │
//! │  Routing layer     │   │        ▼            │   │        ▼            │
//! │  (SCO link-state   │   │  capture thread ────┼──▶│  cpal output stream │
//! │   notifications)   │   │  fixed-size chunks  │   │  (or WAV recorder)  │
//! └────────────────────┘   └─────────────────────┘   └─────────────────────┘
//! ```

pub mod audio;
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod relay;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default chunk size in bytes
    pub const DEFAULT_CHUNK_SIZE: usize = 2048;

    /// Callback buffers queued between the input callback and the capture thread
    pub const CAPTURE_QUEUE_DEPTH: usize = 64;

    /// Default chunks buffered ahead of the output device
    pub const DEFAULT_PLAYBACK_QUEUE_CHUNKS: usize = 8;

    /// Default wait for the SCO link to come up
    pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 5000;
}
