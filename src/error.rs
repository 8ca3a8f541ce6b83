//! Error types.
//!
//! Only construction and start-up can fail. Once the mixer runs, lost signal,
//! corrupted frames, timecode jumps and unplugged devices are counted and
//! logged, never returned as errors.

/// Errors that prevent a mixer from being built or started
#[derive(Debug, thiserror::Error)]
pub enum MixerError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("no capture channels configured")]
    NoChannels,

    #[error("master channel {master} out of range ({num_channels} channels)")]
    MasterOutOfRange { master: usize, num_channels: usize },

    #[error("channel {channel} out of range ({num_channels} channels)")]
    ChannelOutOfRange { channel: usize, num_channels: usize },

    #[error("capture channel {channel} failed to start: {source}")]
    Capture {
        channel: usize,
        #[source]
        source: CaptureError,
    },

    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("audio resampler setup failed: {0}")]
    Resampler(#[from] rubato::ResamplerConstructionError),
}

/// Errors from capture drivers
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("no frame callback registered")]
    NoCallback,

    #[error("driver already running")]
    AlreadyRunning,

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single failed render; the tick still advances pts
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Failed(String),

    #[error("no input frames available")]
    NoInput,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload of {len} bytes failed: {reason}")]
    Failed { len: usize, reason: String },
}
