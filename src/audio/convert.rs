//! Card PCM to the mixer's interleaved stereo `f32`

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// 16, 24 (packed) or 32, little-endian signed
    pub bits_per_sample: u16,
    pub num_channels: u16,
}

impl AudioFormat {
    pub fn bytes_per_frame(&self) -> usize {
        usize::from(self.bits_per_sample / 8) * usize::from(self.num_channels)
    }

    /// Number of sample frames (one sample per channel) in `len` bytes.
    pub fn num_samples(&self, len: usize) -> usize {
        match self.bytes_per_frame() {
            0 => 0,
            n => len / n,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            bits_per_sample: 32,
            num_channels: 2,
        }
    }
}

/// Convert to interleaved stereo. Mono is duplicated, channels past the
/// first two are dropped, unsupported sample sizes give silence.
pub fn to_stereo_f32(data: &[u8], format: AudioFormat) -> Vec<f32> {
    let bytes_per_sample = usize::from(format.bits_per_sample / 8);
    let channels = usize::from(format.num_channels);
    let num_samples = format.num_samples(data.len());
    let mut out = Vec::with_capacity(num_samples * 2);

    if !matches!(bytes_per_sample, 2..=4) || channels == 0 {
        out.resize(num_samples * 2, 0.0);
        return out;
    }

    let sample_at = |frame: usize, channel: usize| -> f32 {
        let offset = (frame * channels + channel) * bytes_per_sample;
        let s = &data[offset..offset + bytes_per_sample];
        match bytes_per_sample {
            2 => f32::from(i16::from_le_bytes([s[0], s[1]])) / 32768.0,
            3 => (i32::from_le_bytes([0, s[0], s[1], s[2]]) >> 8) as f32 / 8_388_608.0,
            _ => i32::from_le_bytes([s[0], s[1], s[2], s[3]]) as f32 / 2_147_483_648.0,
        }
    };

    for frame in 0..num_samples {
        let left = sample_at(frame, 0);
        let right = if channels > 1 { sample_at(frame, 1) } else { left };
        out.push(left);
        out.push(right);
    }
    out
}
