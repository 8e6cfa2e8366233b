//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::audio::format::PcmFormat;
use crate::error::AudioError;

/// Device description for listings
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device, is_input: bool, is_output: bool) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
            is_input,
            is_output,
        }
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.inner
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Get supported input configurations
    pub fn supported_input_configs(
        &self,
    ) -> Result<Vec<cpal::SupportedStreamConfigRange>, AudioError> {
        self.inner
            .supported_input_configs()
            .map(|iter| iter.collect())
            .map_err(|e| AudioError::DeviceOpen(e.to_string()))
    }

    /// Get supported output configurations
    pub fn supported_output_configs(
        &self,
    ) -> Result<Vec<cpal::SupportedStreamConfigRange>, AudioError> {
        self.inner
            .supported_output_configs()
            .map(|iter| iter.collect())
            .map_err(|e| AudioError::DeviceOpen(e.to_string()))
    }

    /// Pick the device sample format that can carry `format` at its rate and channel count
    ///
    /// Fails with `UnsupportedFormat` when no configuration range matches;
    /// there is no resampling or channel mixing in the relay.
    pub fn negotiate(&self, format: &PcmFormat) -> Result<cpal::SampleFormat, AudioError> {
        let ranges = if self.is_input {
            self.supported_input_configs()?
        } else {
            self.supported_output_configs()?
        };
        let rate = cpal::SampleRate(format.sample_rate);
        let channels = format.channels.count();

        let mut matching: Vec<cpal::SampleFormat> = ranges
            .iter()
            .filter(|r| {
                r.channels() == channels
                    && rate >= r.min_sample_rate()
                    && rate <= r.max_sample_rate()
            })
            .map(|r| r.sample_format())
            .filter(|f| is_convertible(*f))
            .collect();

        // Prefer a native 16-bit stream, then float
        matching.sort_by_key(|f| match f {
            cpal::SampleFormat::I16 => 0,
            cpal::SampleFormat::F32 => 1,
            _ => 2,
        });

        matching.first().copied().ok_or_else(|| {
            AudioError::UnsupportedFormat(format!("{} not supported by '{}'", format, self.name))
        })
    }
}

fn is_convertible(format: cpal::SampleFormat) -> bool {
    matches!(
        format,
        cpal::SampleFormat::I16 | cpal::SampleFormat::U16 | cpal::SampleFormat::F32
    )
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let is_default = default_input_name.as_ref() == Some(&name);
                let (sample_rates, channels) = get_device_capabilities(&device, true);

                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    name,
                    is_input: true,
                    is_output: false,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);

                // Devices that do both are listed once
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                } else {
                    let (sample_rates, channels) = get_device_capabilities(&device, false);
                    devices.push(AudioDeviceInfo {
                        id: format!("output:{}", name),
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                        sample_rates,
                        channels,
                    });
                }
            }
        }
    }

    devices
}

fn get_device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        // Rates a headset or built-in mic is likely to offer
        for rate_val in [8000u32, 16000, 22050, 32000, 44100, 48000] {
            let rate = cpal::SampleRate(rate_val);
            if rate >= config.min_sample_rate()
                && rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate_val)
            {
                sample_rates.push(rate_val);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    sample_rates.sort();
    channels.sort();
    (sample_rates, channels)
}

/// Get a device by its ID (`input:<name>` or `output:<name>`)
pub fn get_device_by_id(id: &str) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let (is_input, name) = if let Some(name) = id.strip_prefix("input:") {
        (true, name)
    } else if let Some(name) = id.strip_prefix("output:") {
        (false, name)
    } else {
        (true, id)
    };

    let devices = if is_input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(AudioDevice::from_cpal(device, is_input, !is_input));
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// Get default input device
pub fn get_default_input_device() -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    host.default_input_device()
        .map(|d| AudioDevice::from_cpal(d, true, false))
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

/// Get default output device
pub fn get_default_output_device() -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    host.default_output_device()
        .map(|d| AudioDevice::from_cpal(d, false, true))
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

/// Whether the host lets this process enumerate capture devices at all
///
/// An empty list still counts; a missing microphone is a device-open failure.
pub fn input_access_granted() -> bool {
    cpal::default_host().input_devices().is_ok()
}

/// Resolve a configured capture device name, falling back to the host default
pub fn open_input(name: Option<&str>) -> Result<AudioDevice, AudioError> {
    match name {
        Some(name) => get_device_by_id(&format!("input:{}", name)),
        None => get_default_input_device(),
    }
}

/// Resolve a configured playback device name, falling back to the host default
pub fn open_output(name: Option<&str>) -> Result<AudioDevice, AudioError> {
    match name {
        Some(name) => get_device_by_id(&format!("output:{}", name)),
        None => get_default_output_device(),
    }
}
