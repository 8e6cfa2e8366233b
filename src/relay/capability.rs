//! Capabilities the host must grant before a relay controller exists

use serde::Serialize;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub audio_capture: bool,
    pub bluetooth_control: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            audio_capture: true,
            bluetooth_control: true,
        }
    }

    pub fn none() -> Self {
        Self {
            audio_capture: false,
            bluetooth_control: false,
        }
    }

    /// Capabilities granted by a desktop audio host
    ///
    /// Capture is granted when the host allows input enumeration, whether or
    /// not a microphone is plugged in. Headset routing needs no grant here: a
    /// system without it reports unsupported hardware on `start(Bluetooth)`.
    pub fn from_host() -> Self {
        Self {
            audio_capture: crate::audio::device::input_access_granted(),
            bluetooth_control: true,
        }
    }

    /// Fails with a permission error naming the first missing capability
    pub fn require_all(&self) -> Result<(), RelayError> {
        if !self.audio_capture {
            return Err(RelayError::Permission("audio capture".into()));
        }
        if !self.bluetooth_control {
            return Err(RelayError::Permission("bluetooth control".into()));
        }
        Ok(())
    }
}
