use thiserror::Error;

/// Result alias used throughout the audio pipeline.
pub type AudioResult<T> = Result<T, AudioError>;

/// Error kinds surfaced by the audio subsystems.
///
/// Operations that return one of these keep the component in a coherent
/// state; only allocation failure during construction is allowed to abort.
/// The audio thread never propagates these upward, it records them into
/// counters and publishes asynchronously.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("failed to open device '{device}': {reason}")]
    OpenFailed { device: String, reason: String },

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("denoiser model initialization failed: {0}")]
    ModelInitFailed(String),

    #[error("format mismatch: frame rate {frame_rate} Hz, output rate {output_rate} Hz")]
    FormatMismatch { frame_rate: u32, output_rate: u32 },

    #[error("write to output device failed")]
    WriteFailed,

    #[error("event queue full")]
    QueueFull,

    #[error("listener exceeded the delivery timeout")]
    ListenerTimeout,

    #[error("allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },

    #[error("component is not initialized")]
    NotInitialized,

    #[error("virtual audio routing is not supported on this platform")]
    Unsupported,
}
