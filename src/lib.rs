pub mod audio;
pub mod capture;
pub mod error;
pub mod gpu;
pub mod pipeline;

use std::path::Path;

use serde::{Deserialize, Serialize};

use capture::frame::VideoFormat;
pub use error::MixerError;

/// Presentation-time units per second.
pub const TIMEBASE: i64 = 120_000;

/// Sample rate of the mixed audio output.
pub const OUTPUT_FREQUENCY: u32 = 48_000;

/// Highest frame rate any source is expected to run at.
pub const MAX_FPS: u32 = 60;

/// Output samples covering `length` `TIMEBASE` units, rounded to nearest.
pub fn samples_per_duration(length: i64) -> usize {
    let length = length.max(0);
    ((i64::from(OUTPUT_FREQUENCY) * length + TIMEBASE / 2) / TIMEBASE) as usize
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mixer: MixerConfig,
    pub audio: AudioConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    pub master_channel: usize,
    pub master_timeout_ms: u64,
    /// Pin the mixer thread to this CPU
    pub cpu_affinity: Option<usize>,
    pub num_aux_outputs: usize,
    /// Attach a wall-clock paced output and let it drive the ticks
    pub output_device: bool,
    /// How long shutdown waits for outstanding renders
    pub fence_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub target_delay_ms: u32,
    /// Interleaved samples held for the playback consumer
    pub ring_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Pooled frame buffers per channel
    pub buffer_count: usize,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    Fake,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: CaptureKind,
    /// Device node for V4L2 channels; detected when unset
    pub device: Option<String>,
    pub format: VideoFormat,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            master_channel: 0,
            master_timeout_ms: 100,
            cpu_affinity: None,
            num_aux_outputs: 0,
            output_device: false,
            fence_timeout_ms: 500,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            target_delay_ms: 40,
            // half a second of stereo
            ring_capacity: OUTPUT_FREQUENCY as usize,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_count: 16,
            channels: vec![ChannelConfig::default()],
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "fake".into(),
            kind: CaptureKind::Fake,
            device: None,
            format: VideoFormat::default(),
        }
    }
}

impl Config {
    /// Defaults, overlaid with `path` (TOML) if given, overlaid with
    /// `APOLLO__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, MixerError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("APOLLO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::io::Write;

    #[test]
    fn samples_per_frame_at_common_rates() {
        assert_eq!(samples_per_duration(TIMEBASE / 60), 800);
        assert_eq!(samples_per_duration(TIMEBASE / 50), 960);
        // 59.94 rounds to nearest
        assert_eq!(samples_per_duration(TIMEBASE * 1001 / 60000), 801);
        assert_eq!(samples_per_duration(-5), 0);
    }

    #[test]
    fn defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.mixer.master_timeout_ms, 100);
        assert_eq!(config.capture.channels.len(), 1);
        assert_eq!(config.capture.channels[0].kind, CaptureKind::Fake);
    }

    #[test]
    fn loads_partial_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[mixer]
master_channel = 1
num_aux_outputs = 2

[[capture.channels]]
name = "cam a"

[[capture.channels]]
name = "cam b"
format = {{ width = 1920, height = 1080, frame_rate_nom = 50, pixel_format = "v210" }}
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.mixer.master_channel, 1);
        assert_eq!(config.mixer.num_aux_outputs, 2);
        assert_eq!(config.mixer.master_timeout_ms, 100);
        assert_eq!(config.capture.buffer_count, 16);
        assert_eq!(config.capture.channels.len(), 2);
        let b = &config.capture.channels[1];
        assert_eq!(b.kind, CaptureKind::Fake);
        assert_eq!(b.format.width, 1920);
        assert_eq!(b.format.frame_rate_den, 1);
        assert_eq!(b.format.pixel_format, PixelFormat::V210);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(MixerError::Config(_))));
    }
}
