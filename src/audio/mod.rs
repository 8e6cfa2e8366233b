//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod format;
pub mod mock;
pub mod playback;
pub mod recorder;

pub use buffer::{PcmChunk, TransportBuffer};
pub use capture::{AudioSource, CpalSource};
pub use device::{list_devices, AudioDevice, AudioDeviceInfo};
pub use format::{ChannelLayout, PcmFormat, SampleEncoding};
pub use playback::{AudioSink, CpalSink};
pub use recorder::{TeeSink, WavFileSink};
