// cpal-backed device discovery.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;
use tracing::warn;

use super::types::{classify_virtual, DeviceDescriptor, DeviceKind};
use crate::error::{AudioError, AudioResult};

/// Sample rates probed against each device's supported ranges.
const CANDIDATE_RATES: [u32; 11] = [
    8000, 11025, 16000, 22050, 32000, 44100, 48000, 88200, 96000, 176400, 192000,
];

/// Power-of-two buffer sizes the engine accepts.
const CANDIDATE_BUFFER_SIZES: [u32; 9] = [32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// Thin wrapper over the cpal host used for all discovery.
pub struct DeviceEnumerator {
    host: cpal::Host,
}

impl std::fmt::Debug for DeviceEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEnumerator")
            .field("host", &self.host.id().name())
            .finish()
    }
}

impl DeviceEnumerator {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    /// All capture devices the host exposes.
    pub fn list_inputs(&self) -> AudioResult<Vec<DeviceDescriptor>> {
        let devices = self.host.input_devices().map_err(|e| AudioError::OpenFailed {
            device: "input enumeration".to_string(),
            reason: e.to_string(),
        })?;

        let mut result = Vec::new();
        for device in devices {
            let Ok(name) = device.name() else {
                continue;
            };
            match input_descriptor(&device, &name) {
                Some(descriptor) => result.push(descriptor),
                None => warn!("skipping input '{}' with no usable configs", name),
            }
        }
        Ok(result)
    }

    /// Render devices whose names match a known virtual loopback driver.
    pub fn list_virtual_outputs(&self) -> AudioResult<Vec<DeviceDescriptor>> {
        let devices = self.host.output_devices().map_err(|e| AudioError::OpenFailed {
            device: "output enumeration".to_string(),
            reason: e.to_string(),
        })?;

        let mut result = Vec::new();
        for device in devices {
            let Ok(name) = device.name() else {
                continue;
            };
            let Some(virtual_kind) = classify_virtual(&name) else {
                continue;
            };
            if let Some(descriptor) = output_descriptor(&device, &name, virtual_kind) {
                result.push(descriptor);
            }
        }
        Ok(result)
    }

    /// Resolve a capture device by its generated id.
    pub fn find_input(&self, device_id: &str) -> AudioResult<Device> {
        let devices = self.host.input_devices().map_err(|e| AudioError::OpenFailed {
            device: device_id.to_string(),
            reason: e.to_string(),
        })?;
        for device in devices {
            if let Ok(name) = device.name() {
                if input_device_id(&name) == device_id {
                    return Ok(device);
                }
            }
        }
        Err(AudioError::DeviceNotFound(device_id.to_string()))
    }

    /// Resolve a virtual output device by its generated id.
    pub fn find_virtual_output(&self, device_id: &str) -> AudioResult<Device> {
        let devices = self.host.output_devices().map_err(|e| AudioError::OpenFailed {
            device: device_id.to_string(),
            reason: e.to_string(),
        })?;
        for device in devices {
            if let Ok(name) = device.name() {
                if classify_virtual(&name).is_some() && output_device_id(&name) == device_id {
                    return Ok(device);
                }
            }
        }
        Err(AudioError::DeviceNotFound(device_id.to_string()))
    }

    /// The host's default capture device, if any.
    pub fn default_input(&self) -> Option<Device> {
        self.host.default_input_device()
    }
}

impl Default for DeviceEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable id for a capture device, derived from its display name.
pub fn input_device_id(name: &str) -> String {
    format!("input_{}", sanitize_name(name))
}

/// Stable id for a render device, derived from its display name.
pub fn output_device_id(name: &str) -> String {
    format!("output_{}", sanitize_name(name))
}

fn sanitize_name(name: &str) -> String {
    name.replace(' ', "_")
        .replace(['(', ')'], "")
        .to_lowercase()
}

fn input_descriptor(device: &Device, name: &str) -> Option<DeviceDescriptor> {
    let configs: Vec<_> = device.supported_input_configs().ok()?.collect();
    if configs.is_empty() {
        return None;
    }
    Some(DeviceDescriptor {
        id: input_device_id(name),
        name: name.to_string(),
        kind: DeviceKind::PhysicalInput,
        max_channels: configs.iter().map(|c| c.channels()).max().unwrap_or(1),
        sample_rates: supported_rates(&configs),
        buffer_sizes: supported_buffer_sizes(&configs),
        connected: true,
    })
}

fn output_descriptor(
    device: &Device,
    name: &str,
    virtual_kind: super::types::VirtualKind,
) -> Option<DeviceDescriptor> {
    let configs: Vec<_> = device.supported_output_configs().ok()?.collect();
    if configs.is_empty() {
        return None;
    }
    Some(DeviceDescriptor {
        id: output_device_id(name),
        name: name.to_string(),
        kind: DeviceKind::VirtualOutput(virtual_kind),
        max_channels: configs.iter().map(|c| c.channels()).max().unwrap_or(2),
        sample_rates: supported_rates(&configs),
        buffer_sizes: supported_buffer_sizes(&configs),
        connected: true,
    })
}

fn supported_rates(configs: &[cpal::SupportedStreamConfigRange]) -> Vec<u32> {
    let mut rates: Vec<u32> = CANDIDATE_RATES
        .iter()
        .copied()
        .filter(|&rate| {
            configs.iter().any(|c| {
                rate >= c.min_sample_rate().0 && rate <= c.max_sample_rate().0
            })
        })
        .collect();
    rates.dedup();
    rates
}

fn supported_buffer_sizes(configs: &[cpal::SupportedStreamConfigRange]) -> Vec<u32> {
    CANDIDATE_BUFFER_SIZES
        .iter()
        .copied()
        .filter(|&size| {
            configs.iter().any(|c| match c.buffer_size() {
                cpal::SupportedBufferSize::Range { min, max } => size >= *min && size <= *max,
                cpal::SupportedBufferSize::Unknown => true,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_are_stable_and_lowercase() {
        assert_eq!(
            input_device_id("USB Microphone (C-1)"),
            "input_usb_microphone_c-1"
        );
        assert_eq!(
            output_device_id("CABLE Input (VB-Audio Virtual Cable)"),
            "output_cable_input_vb-audio_virtual_cable"
        );
    }
}
