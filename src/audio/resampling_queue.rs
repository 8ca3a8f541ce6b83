//! Per-channel audio FIFO with drift-correcting resampling
//!
//! Every card runs on its own audio clock. The queue aims to keep a fixed
//! amount of audio buffered; when asked to, it nudges the resampling ratio
//! proportionally to how far the buffered delay is from that target. The
//! resampling itself is a band-limited sinc resampler whose relative ratio is
//! ramped between chunks.

use std::collections::VecDeque;

use rubato::{
    Resampler, ResamplerConstructionError, SincFixedOut, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use tracing::{debug, warn};

/// Largest ratio deviation the controller may apply.
const MAX_RATIO_DEVIATION: f64 = 0.005;

/// Proportional gain from relative delay error to ratio deviation.
const RATIO_GAIN: f64 = 0.002;

/// Low-pass factor for ratio updates.
const RATIO_SMOOTHING: f64 = 0.1;

/// Output frames produced per resampler call.
const OUTPUT_CHUNK: usize = 64;

/// Headroom the resampler is built with for relative ratio changes.
const MAX_RELATIVE_RATIO: f64 = 1.1;

/// A backlog above this many target delays is discarded instead of drained
/// through the rate controller.
const MAX_DELAY_FACTOR: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAdjustmentPolicy {
    AdjustRate,
    DoNotAdjustRate,
}

fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    }
}

pub struct ResamplingQueue {
    channel: usize,
    /// Input sample frames not yet handed to the resampler
    input: VecDeque<[f32; 2]>,
    /// Resampled frames not yet pulled
    resampled: VecDeque<[f32; 2]>,
    resampler: SincFixedOut<f32>,
    /// Deinterleave scratch, one vector per side
    planar: [Vec<f32>; 2],
    /// Input frames consumed per output frame
    ratio: f64,
    target_delay: usize,
    underruns: u64,
    silence_insertions: u64,
    overflows: u64,
}

impl ResamplingQueue {
    /// `target_delay` is in sample frames; 0 disables rate steering.
    pub fn new(channel: usize, target_delay: usize) -> Result<Self, ResamplerConstructionError> {
        let resampler =
            SincFixedOut::<f32>::new(1.0, MAX_RELATIVE_RATIO, sinc_parameters(), OUTPUT_CHUNK, 2)?;
        Ok(Self {
            channel,
            input: VecDeque::new(),
            resampled: VecDeque::new(),
            resampler,
            planar: [Vec::new(), Vec::new()],
            ratio: 1.0,
            target_delay,
            underruns: 0,
            silence_insertions: 0,
            overflows: 0,
        })
    }

    pub fn add_input_samples(&mut self, stereo: &[f32]) {
        self.input
            .extend(stereo.chunks_exact(2).map(|s| [s[0], s[1]]));
    }

    pub fn add_silence(&mut self, num_frames: usize) {
        self.input.extend(std::iter::repeat([0.0; 2]).take(num_frames));
        self.silence_insertions += 1;
    }

    pub fn reset(&mut self) {
        debug!(card = self.channel, "Resetting resampler");
        self.input.clear();
        self.resampled.clear();
        self.resampler.reset();
        self.ratio = 1.0;
        self.apply_ratio(false);
    }

    /// Buffered audio, in sample frames, on either side of the resampler.
    pub fn buffered(&self) -> usize {
        self.input.len() + self.resampled.len()
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    pub fn silence_insertions(&self) -> u64 {
        self.silence_insertions
    }

    /// How often a runaway backlog was cut back to the target delay.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    fn apply_ratio(&mut self, ramp: bool) {
        // rubato's ratio is output over input, ours the other way round.
        if let Err(e) = self.resampler.set_resample_ratio_relative(1.0 / self.ratio, ramp) {
            warn!(card = self.channel, ratio = self.ratio, "Rejected resampling ratio: {e}");
        }
    }

    /// Drop the oldest audio when the backlog is too large to ever be
    /// steered back, e.g. after the master clock stalled for seconds.
    fn trim_backlog(&mut self) {
        let limit = self.target_delay * MAX_DELAY_FACTOR;
        let buffered = self.buffered();
        if buffered <= limit {
            return;
        }
        let mut excess = buffered - self.target_delay;
        let from_resampled = excess.min(self.resampled.len());
        self.resampled.drain(..from_resampled);
        excess -= from_resampled;
        self.input.drain(..excess.min(self.input.len()));
        self.overflows += 1;
        warn!(
            card = self.channel,
            buffered,
            target = self.target_delay,
            "Audio backlog too large, dropping the oldest samples"
        );
    }

    fn steer(&mut self) {
        let error =
            (self.buffered() as f64 - self.target_delay as f64) / self.target_delay as f64;
        let wanted = 1.0 + (error * RATIO_GAIN).clamp(-MAX_RATIO_DEVIATION, MAX_RATIO_DEVIATION);
        self.ratio += (wanted - self.ratio) * RATIO_SMOOTHING;
        self.apply_ratio(true);
    }

    /// Resample until `wanted` frames are ready. False if input ran out.
    fn refill(&mut self, wanted: usize) -> bool {
        while self.resampled.len() < wanted {
            let needed = self.resampler.input_frames_next();
            if self.input.len() < needed {
                return false;
            }
            let [left, right] = &mut self.planar;
            left.clear();
            right.clear();
            for [l, r] in self.input.drain(..needed) {
                left.push(l);
                right.push(r);
            }
            match self.resampler.process(&self.planar[..], None) {
                Ok(out) => self
                    .resampled
                    .extend(out[0].iter().zip(&out[1]).map(|(&l, &r)| [l, r])),
                Err(e) => {
                    warn!(card = self.channel, "Resampling failed: {e}");
                    return false;
                }
            }
        }
        true
    }

    /// Produce `num_frames` stereo frames, mixed into `out` with `gain`.
    pub fn get_output_samples(
        &mut self,
        out: &mut [f32],
        num_frames: usize,
        gain: f32,
        policy: RateAdjustmentPolicy,
    ) {
        if policy == RateAdjustmentPolicy::AdjustRate && self.target_delay > 0 {
            self.trim_backlog();
            self.steer();
        }

        let complete = self.refill(num_frames);
        let available = num_frames.min(self.resampled.len());
        for (dst, s) in out.chunks_exact_mut(2).zip(self.resampled.drain(..available)) {
            dst[0] += gain * s[0];
            dst[1] += gain * s[1];
        }

        if !complete {
            self.underruns += 1;
            if self.underruns.is_power_of_two() {
                warn!(card = self.channel, underruns = self.underruns, "Audio underrun, padding with silence");
            }
        }
    }
}
