//! Relay configuration
//!
//! Read from `config.toml` in the platform config directory (or an explicit
//! path). Every field has a default, so a missing file or a partial file is
//! fine:
//!
//! ```toml
//! [audio]
//! sample_rate = 44100
//! channels = 1
//! encoding = "pcm16"
//! chunk_size = 2048
//!
//! [bluetooth]
//! negotiation_timeout_ms = 5000
//! hands_free_profile = "headset-head-unit"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::format::{ChannelLayout, PcmFormat, SampleEncoding};
use crate::constants;
use crate::error::{Error, Result};

/// Environment variable that overrides the config file location
pub const CONFIG_PATH_ENV: &str = "MIC_RELAY_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub audio: AudioConfig,
    pub devices: DeviceConfig,
    pub bluetooth: BluetoothConfig,
    pub recording: RecordingConfig,
}

/// PCM format and chunking for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
    /// Bytes per chunk
    pub chunk_size: usize,
    /// Chunks buffered between `write` and the playback device
    pub playback_queue_chunks: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: constants::DEFAULT_SAMPLE_RATE,
            channels: 1,
            encoding: SampleEncoding::Pcm16,
            chunk_size: constants::DEFAULT_CHUNK_SIZE,
            playback_queue_chunks: constants::DEFAULT_PLAYBACK_QUEUE_CHUNKS,
        }
    }
}

impl AudioConfig {
    /// Validated session format and chunk size
    pub fn session_format(&self) -> Result<(PcmFormat, usize)> {
        let channels = ChannelLayout::from_count(self.channels)?;
        let format = PcmFormat::new(self.sample_rate, channels, self.encoding);
        format.validate_chunk_size(self.chunk_size)?;
        if self.playback_queue_chunks == 0 {
            return Err(Error::Config("playback_queue_chunks must be > 0".into()));
        }
        Ok((format, self.chunk_size))
    }
}

/// Device selection; `None` picks the host default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub capture: Option<String>,
    pub playback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub negotiation_timeout_ms: u64,
    /// Substring of the BlueZ card name; first headset card when unset
    pub card: Option<String>,
    /// Card profile (prefix) that carries the SCO link
    pub hands_free_profile: String,
    /// Profile restored when the link is released
    pub restore_profile: String,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: constants::DEFAULT_NEGOTIATION_TIMEOUT_MS,
            card: None,
            hands_free_profile: "headset-head-unit".to_string(),
            restore_profile: "a2dp-sink".to_string(),
        }
    }
}

impl BluetoothConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Record alongside the live relay to this file
    pub path: Option<PathBuf>,
    /// Where generated recording names are placed
    pub directory: Option<PathBuf>,
}

impl RecordingConfig {
    pub fn directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_recordings_dir)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "mic-relay")
}

fn default_recordings_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("recordings"))
        .unwrap_or_else(|| PathBuf::from("recordings"))
}

impl RelayConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        project_dirs()
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("mic-relay.toml"))
    }

    /// Load from `path`, or defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.audio.session_format()?;
        if self.bluetooth.negotiation_timeout_ms == 0 {
            return Err(Error::Config("negotiation_timeout_ms must be > 0".into()));
        }
        if self.bluetooth.hands_free_profile.is_empty() {
            return Err(Error::Config("hands_free_profile must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        let (format, chunk_size) = config.audio.session_format().unwrap();
        assert_eq!(format, PcmFormat::mono16(44100));
        assert_eq!(chunk_size, 2048);
        assert_eq!(config.bluetooth.negotiation_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [audio]
            sample_rate = 16000
            channels = 2

            [bluetooth]
            card = "00_1B_66"
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.audio.chunk_size, 2048);
        assert_eq!(config.bluetooth.card.as_deref(), Some("00_1B_66"));
        assert_eq!(config.bluetooth.hands_free_profile, "headset-head-unit");
        assert_eq!(config.devices, DeviceConfig::default());
    }

    #[test]
    fn test_rejects_bad_audio_settings() {
        let mut config = RelayConfig::default();
        config.audio.channels = 6;
        assert_eq!(config.validate().unwrap_err().reason_code(), "device_open");

        let mut config = RelayConfig::default();
        config.audio.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.audio.channels = 2;
        config.audio.chunk_size = 2050;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.bluetooth.negotiation_timeout_ms = 0;
        assert_eq!(config.validate().unwrap_err().reason_code(), "config");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = RelayConfig::default();
        config.audio.encoding = SampleEncoding::Pcm8;
        config.devices.capture = Some("USB Mic".into());
        config.recording.path = Some(dir.path().join("out.wav"));
        config.save(&path).unwrap();

        assert_eq!(RelayConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audio]\nsample_rate = \"fast\"\n").unwrap();
        assert_eq!(RelayConfig::load(&path).unwrap_err().reason_code(), "config");
    }
}
