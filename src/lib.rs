pub mod audio;
pub mod config;
pub mod error;
pub mod log;

// Re-export the public surface for external use and tests
pub use audio::{
    AudioFrame, Denoiser, DenoiserConfig, DenoiserStats, DeviceDescriptor, DeviceEnumerator,
    DeviceKind, Event, EventBus, EventBusConfig, EventBusStats, EventKind, EventPayload,
    FrameRing, FrameRingConfig, InputEngine, ListenerHandle, MockOutput, OutputFormat,
    OutputRouter, ReductionStrength, RouterBackend, RouterState, RouterStats, VirtualKind,
};
pub use config::Config;
pub use error::{AudioError, AudioResult};
