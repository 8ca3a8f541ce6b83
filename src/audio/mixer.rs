//! Sums every channel's resampled audio into one stereo output

use std::sync::{Mutex, MutexGuard};

use tracing::info;

use super::resampling_queue::{RateAdjustmentPolicy, ResamplingQueue};
use crate::error::MixerError;
use crate::OUTPUT_FREQUENCY;

struct ChannelAudio {
    queue: ResamplingQueue,
    gain: f32,
    resets: u64,
}

/// Thread-safe: driver threads add input, the audio worker pulls output.
pub struct AudioMixer {
    channels: Mutex<Vec<ChannelAudio>>,
}

/// Per-channel audio counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelAudioStats {
    pub buffered: usize,
    pub silence_insertions: u64,
    pub underruns: u64,
    pub resets: u64,
    /// Backlogs cut back to the target delay
    pub overflows: u64,
    pub ratio: f64,
}

impl AudioMixer {
    /// `target_delay_ms` is how much audio each channel tries to keep buffered.
    pub fn new(num_channels: usize, target_delay_ms: u32) -> Result<Self, MixerError> {
        let target_delay = (OUTPUT_FREQUENCY as usize * target_delay_ms as usize) / 1000;
        let channels = (0..num_channels)
            .map(|channel| -> Result<ChannelAudio, MixerError> {
                Ok(ChannelAudio {
                    queue: ResamplingQueue::new(channel, target_delay)?,
                    gain: 1.0,
                    resets: 0,
                })
            })
            .collect::<Result<Vec<_>, MixerError>>()?;
        Ok(Self {
            channels: Mutex::new(channels),
        })
    }

    fn channels(&self) -> MutexGuard<'_, Vec<ChannelAudio>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Interleaved stereo samples received with one frame.
    pub fn add_audio(&self, channel: usize, stereo: &[f32]) {
        if let Some(c) = self.channels().get_mut(channel) {
            c.queue.add_input_samples(stereo);
        }
    }

    /// Stand-in audio for `num_frames` lost video frames.
    pub fn add_silence(&self, channel: usize, samples_per_frame: usize, num_frames: usize) {
        if let Some(c) = self.channels().get_mut(channel) {
            for _ in 0..num_frames {
                c.queue.add_silence(samples_per_frame);
            }
        }
    }

    pub fn reset_resampler(&self, channel: usize) {
        if let Some(c) = self.channels().get_mut(channel) {
            c.queue.reset();
            c.resets += 1;
        }
    }

    pub fn set_gain_db(&self, channel: usize, db: f32) {
        if let Some(c) = self.channels().get_mut(channel) {
            c.gain = 10f32.powf(db / 20.0);
            info!(card = channel, db, "Audio gain changed");
        }
    }

    /// Mix `num_samples` stereo frames from every channel.
    pub fn get_output(&self, num_samples: usize, policy: RateAdjustmentPolicy) -> Vec<f32> {
        let mut out = vec![0.0; num_samples * 2];
        for c in self.channels().iter_mut() {
            c.queue.get_output_samples(&mut out, num_samples, c.gain, policy);
        }
        out
    }

    pub fn stats(&self, channel: usize) -> Option<ChannelAudioStats> {
        self.channels().get(channel).map(|c| ChannelAudioStats {
            buffered: c.queue.buffered(),
            silence_insertions: c.queue.silence_insertions(),
            underruns: c.queue.underruns(),
            resets: c.resets,
            overflows: c.queue.overflows(),
            ratio: c.queue.ratio(),
        })
    }
}
