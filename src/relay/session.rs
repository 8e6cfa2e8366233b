//! Relay session model

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::audio::format::PcmFormat;

/// Where the microphone audio comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// The host's own capture device
    Device,
    /// A hands-free headset over an SCO link
    Bluetooth,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMode::Device => f.write_str("device"),
            SourceMode::Bluetooth => f.write_str("bluetooth"),
        }
    }
}

impl std::str::FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "device" | "mic" => Ok(SourceMode::Device),
            "bluetooth" | "bt" | "headset" => Ok(SourceMode::Bluetooth),
            other => Err(format!("unknown source mode '{}'", other)),
        }
    }
}

/// Lifecycle state of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Negotiating,
    Streaming,
    Stopping,
}

impl SessionState {
    /// Whether a session exists in this state
    pub fn is_active(self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Negotiating => "negotiating",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Relay counters, updated from the capture thread
#[derive(Debug, Default)]
pub struct SessionCounters {
    chunks: AtomicU64,
    bytes: AtomicU64,
}

impl SessionCounters {
    pub fn record(&self, bytes: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// One relay from source to sink, owned by the controller
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub mode: SourceMode,
    pub state: SessionState,
    pub format: PcmFormat,
    pub chunk_size: usize,
    pub created_at: DateTime<Utc>,
    pub streaming_since: Option<DateTime<Utc>>,
    pub counters: Arc<SessionCounters>,
}

impl Session {
    pub fn new(mode: SourceMode, format: PcmFormat, chunk_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            state: SessionState::Idle,
            format,
            chunk_size,
            created_at: Utc::now(),
            streaming_since: None,
            counters: Arc::new(SessionCounters::default()),
        }
    }

    pub fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            mode: self.mode,
            state: self.state,
            sample_rate: self.format.sample_rate,
            channels: self.format.channels.count(),
            bits_per_sample: self.format.encoding.bits_per_sample(),
            chunk_size: self.chunk_size,
            created_at: self.created_at,
            streaming_since: self.streaming_since,
            chunks_relayed: self.counters.chunks(),
            bytes_relayed: self.counters.bytes(),
        }
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub mode: SourceMode,
    pub state: SessionState,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub chunk_size: usize,
    pub created_at: DateTime<Utc>,
    pub streaming_since: Option<DateTime<Utc>>,
    pub chunks_relayed: u64,
    pub bytes_relayed: u64,
}
