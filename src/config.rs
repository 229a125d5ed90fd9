// Persisted user configuration consumed by the audio pipeline.
//
// The file lives at the OS-conventional location
// (`%APPDATA%/quiet/config.json`, `~/.config/quiet/config.json`,
// `~/Library/Application Support/quiet/config.json`) and uses JSON with
// nested sections. Unknown keys are ignored; missing keys take defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::denoiser::ReductionStrength;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioSection,
    pub processing: ProcessingSection,
    pub virtual_device: VirtualDeviceSection,
}

/// Capture-side audio configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioSection {
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub input_device_id: Option<String>,
}

/// Noise-reduction processing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingSection {
    pub noise_reduction_enabled: bool,
    pub reduction_level: ReductionStrength,
    pub vad_threshold: f32,
    pub adaptive_mode: bool,
}

/// Virtual output endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VirtualDeviceSection {
    pub channels: u16,
    pub sample_rate: u32,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffer_size: 512,
            input_device_id: None,
        }
    }
}

impl Default for ProcessingSection {
    fn default() -> Self {
        Self {
            noise_reduction_enabled: true,
            reduction_level: ReductionStrength::Medium,
            vad_threshold: 0.5,
            adaptive_mode: true,
        }
    }
}

impl Default for VirtualDeviceSection {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 48000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// Missing fields use default values; invalid JSON is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("invalid JSON in config file {}", path.display()))?;
        Ok(config.sanitized())
    }

    /// Load configuration from a file, or return defaults if the file is
    /// missing. Invalid JSON still surfaces as an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// The default configuration file path for this OS.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("quiet").join("config.json"))
    }

    /// Clamp out-of-range values to their valid domains.
    fn sanitized(mut self) -> Self {
        self.processing.vad_threshold = self.processing.vad_threshold.clamp(0.0, 1.0);
        self.virtual_device.channels = self.virtual_device.channels.clamp(1, 2);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();

        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.buffer_size, 512);
        assert_eq!(config.audio.input_device_id, None);

        assert!(config.processing.noise_reduction_enabled);
        assert_eq!(config.processing.reduction_level, ReductionStrength::Medium);
        assert_eq!(config.processing.vad_threshold, 0.5);
        assert!(config.processing.adaptive_mode);

        assert_eq!(config.virtual_device.channels, 2);
        assert_eq!(config.virtual_device.sample_rate, 48000);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let json = r#"{
            "audio": { "sample_rate": 44100 },
            "processing": { "reduction_level": "high" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.buffer_size, 512);
        assert_eq!(config.processing.reduction_level, ReductionStrength::High);
        assert!(config.processing.noise_reduction_enabled);
    }

    #[test]
    fn round_trips_through_json() {
        let mut config = Config::default();
        config.audio.input_device_id = Some("input_usb_microphone".to_string());
        config.processing.reduction_level = ReductionStrength::Low;
        config.virtual_device.channels = 1;

        let json = serde_json::to_string(&config).unwrap();
        let restored: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn vad_threshold_is_clamped_on_load() {
        let json = r#"{ "processing": { "vad_threshold": 3.5 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let config = config.sanitized();
        assert_eq!(config.processing.vad_threshold, 1.0);
    }
}
