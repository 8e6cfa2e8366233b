//! Error types for the microphone relay

use thiserror::Error;

use crate::bluetooth::LinkFailure;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable reason code reported to observers
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Audio(e) => e.reason_code(),
            Error::Bluetooth(e) => e.reason_code(),
            Error::Relay(e) => e.reason_code(),
            Error::Config(_) => "config",
            Error::Io(_) => "stream_io",
        }
    }
}

/// Audio subsystem errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    DeviceOpen(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Stream I/O failed: {0}")]
    StreamIo(String),

    #[error("Capture overrun: {0} callback buffers dropped")]
    CaptureOverrun(usize),

    #[error("Device not initialized")]
    NotInitialized,

    #[error("Recording error: {0}")]
    Recording(String),
}

impl AudioError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            AudioError::DeviceNotFound(_)
            | AudioError::DeviceOpen(_)
            | AudioError::UnsupportedFormat(_) => "device_open",
            AudioError::StreamIo(_)
            | AudioError::CaptureOverrun(_)
            | AudioError::NotInitialized
            | AudioError::Recording(_) => "stream_io",
        }
    }
}

impl From<hound::Error> for AudioError {
    fn from(e: hound::Error) -> Self {
        AudioError::Recording(e.to_string())
    }
}

/// Bluetooth link errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BluetoothError {
    #[error("Bluetooth hands-free audio routing is not supported on this system")]
    Unsupported,

    #[error("Link negotiation failed: {0}")]
    NegotiationFailed(LinkFailure),

    #[error("Routing layer error: {0}")]
    Routing(String),
}

impl BluetoothError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            BluetoothError::Unsupported => "unsupported_hardware",
            BluetoothError::NegotiationFailed(LinkFailure::Unsupported) => "unsupported_hardware",
            BluetoothError::NegotiationFailed(_) | BluetoothError::Routing(_) => {
                "negotiation_failed"
            }
        }
    }
}

impl From<LinkFailure> for BluetoothError {
    fn from(reason: LinkFailure) -> Self {
        match reason {
            LinkFailure::Unsupported => BluetoothError::Unsupported,
            other => BluetoothError::NegotiationFailed(other),
        }
    }
}

/// Relay controller errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Missing capability: {0}")]
    Permission(String),

    #[error("A relay session is already {0}")]
    SessionActive(String),

    #[error("Relay controller is shut down")]
    ControllerClosed,
}

impl RelayError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Permission(_) => "permission",
            RelayError::SessionActive(_) => "session_active",
            RelayError::ControllerClosed => "controller_closed",
        }
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_follow_taxonomy() {
        let unsupported: Error = BluetoothError::Unsupported.into();
        assert_eq!(unsupported.reason_code(), "unsupported_hardware");

        let timeout: Error = BluetoothError::from(LinkFailure::Timeout).into();
        assert_eq!(timeout.reason_code(), "negotiation_failed");

        let open: Error = AudioError::DeviceOpen("busy".into()).into();
        assert_eq!(open.reason_code(), "device_open");

        let io: Error = AudioError::StreamIo("read failed".into()).into();
        assert_eq!(io.reason_code(), "stream_io");

        let perm: Error = RelayError::Permission("audio capture".into()).into();
        assert_eq!(perm.reason_code(), "permission");
    }

    #[test]
    fn test_unsupported_link_failure_maps_to_hardware_error() {
        assert_eq!(
            BluetoothError::from(LinkFailure::Unsupported),
            BluetoothError::Unsupported
        );
    }
}
