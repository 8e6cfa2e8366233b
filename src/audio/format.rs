//! PCM stream format

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::AudioError;

/// Sample encoding of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    /// Signed 16-bit little-endian
    #[default]
    Pcm16,
    /// Unsigned 8-bit
    Pcm8,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Pcm16 => 2,
            SampleEncoding::Pcm8 => 1,
        }
    }

    pub fn bits_per_sample(self) -> u16 {
        self.bytes_per_sample() as u16 * 8
    }

    /// Append one normalized sample in this encoding
    pub fn encode(self, sample: f32, out: &mut Vec<u8>) {
        let clamped = sample.clamp(-1.0, 1.0);
        match self {
            SampleEncoding::Pcm16 => {
                let value = (clamped * i16::MAX as f32) as i16;
                out.extend_from_slice(&value.to_le_bytes());
            }
            SampleEncoding::Pcm8 => {
                out.push(((clamped * 127.0) as i16 + 128) as u8);
            }
        }
    }

    /// Decode one sample; `bytes` must hold at least `bytes_per_sample()` bytes
    pub fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            SampleEncoding::Pcm16 => {
                i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / i16::MAX as f32
            }
            SampleEncoding::Pcm8 => (bytes[0] as f32 - 128.0) / 127.0,
        }
    }
}

/// Channel layout of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    #[default]
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn count(self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }

    pub fn from_count(channels: u16) -> Result<Self, AudioError> {
        match channels {
            1 => Ok(ChannelLayout::Mono),
            2 => Ok(ChannelLayout::Stereo),
            n => Err(AudioError::UnsupportedFormat(format!(
                "{} channels (expected 1 or 2)",
                n
            ))),
        }
    }
}

/// Format shared by the capture and playback sides of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: ChannelLayout,
    pub encoding: SampleEncoding,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: ChannelLayout, encoding: SampleEncoding) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
        }
    }

    /// 16-bit mono at the given rate
    pub fn mono16(sample_rate: u32) -> Self {
        Self::new(sample_rate, ChannelLayout::Mono, SampleEncoding::Pcm16)
    }

    /// Bytes in one frame (one sample for every channel)
    pub fn frame_bytes(&self) -> usize {
        self.channels.count() as usize * self.encoding.bytes_per_sample()
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_bytes()
    }

    /// Playback duration of `bytes` of audio in this format
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let bps = self.bytes_per_second().max(1) as u64;
        Duration::from_micros(bytes as u64 * 1_000_000 / bps)
    }

    /// Check the format and a chunk size for use in a session
    pub fn validate_chunk_size(&self, chunk_size: usize) -> Result<(), AudioError> {
        if self.sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat("sample rate must be > 0".into()));
        }
        if chunk_size == 0 {
            return Err(AudioError::UnsupportedFormat("chunk size must be > 0".into()));
        }
        if chunk_size % self.frame_bytes() != 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "chunk size {} is not a whole number of {}-byte frames",
                chunk_size,
                self.frame_bytes()
            )));
        }
        Ok(())
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::mono16(crate::constants::DEFAULT_SAMPLE_RATE)
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}bit",
            self.sample_rate,
            self.channels.count(),
            self.encoding.bits_per_sample()
        )
    }
}
