use serde::{Deserialize, Serialize};

/// Which third-party loopback driver a virtual output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtualKind {
    VbCable,
    BlackHole,
    Other,
}

/// Role of a device in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    PhysicalInput,
    VirtualOutput(VirtualKind),
}

/// Stable identity and capabilities of an audio endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub max_channels: u16,
    pub sample_rates: Vec<u32>,
    pub buffer_sizes: Vec<u32>,
    /// Result of the most recent probe; hot-plug rescans keep it current.
    pub connected: bool,
}

impl DeviceDescriptor {
    pub fn is_virtual_output(&self) -> bool {
        matches!(self.kind, DeviceKind::VirtualOutput(_))
    }
}

/// Name patterns that identify installed virtual loopback endpoints.
const VIRTUAL_PATTERNS: [(&str, VirtualKind); 4] = [
    ("VB-Audio", VirtualKind::VbCable),
    ("CABLE Input", VirtualKind::VbCable),
    ("VB-Cable", VirtualKind::VbCable),
    ("BlackHole", VirtualKind::BlackHole),
];

/// Classify a device name as a virtual output, if it matches a known
/// driver pattern.
pub fn classify_virtual(name: &str) -> Option<VirtualKind> {
    VIRTUAL_PATTERNS
        .iter()
        .find(|(pattern, _)| name.contains(pattern))
        .map(|&(_, kind)| kind)
}
