// Audio module - the real-time noise-reduction pipeline
//
// This module provides the core audio system broken down into logical
// components:
// - frame: multi-channel planar sample container with SIMD helpers
// - ring_buffer: lock-free SPSC sample store
// - events: asynchronous typed pub/sub gluing the components together
// - devices: device identity and host enumeration
// - input: capture device lifecycle and real-time frame delivery
// - denoiser: frame-aligned noise reduction with resampling
// - router: virtual-output routing with hot-plug recovery

pub mod denoiser;
pub mod devices;
pub mod events;
pub mod frame;
pub mod input;
pub mod resampler;
pub mod ring_buffer;
pub mod router;

// Re-export commonly used types for easier imports
pub use denoiser::{
    Denoiser, DenoiserConfig, DenoiserStats, ReductionStrength, MODEL_FRAME_SIZE,
};
pub use devices::{DeviceDescriptor, DeviceEnumerator, DeviceKind, VirtualKind};
pub use events::{
    Event, EventBus, EventBusConfig, EventBusStats, EventKind, EventPayload, ListenerHandle,
};
pub use frame::AudioFrame;
pub use input::InputEngine;
pub use ring_buffer::{FrameRing, FrameRingConfig, RingConsumer, RingProducer};
pub use router::{
    MockOutput, OutputFormat, OutputRouter, RouterBackend, RouterState, RouterStats,
};
