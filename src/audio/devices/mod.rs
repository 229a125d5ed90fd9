// Device identity and host enumeration.
//
// The descriptors here are the stable identities the rest of the pipeline
// trades in; the enumerator is the only place that talks to the cpal host
// for discovery.

pub mod enumeration;
pub mod types;

pub use enumeration::DeviceEnumerator;
pub use types::{DeviceDescriptor, DeviceKind, VirtualKind};
