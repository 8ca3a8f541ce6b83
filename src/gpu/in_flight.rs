//! Input frames still being read by the GPU

use std::time::{Duration, Instant};

use tracing::warn;

use super::fence::GpuFence;
use crate::capture::frame::RefCountedFrame;

/// Keeps input frames alive until the fence of the render that read them is
/// satisfied. Only touched from the mixer thread.
#[derive(Default)]
pub struct InFlightFrames {
    pending: Vec<(GpuFence, Vec<RefCountedFrame>)>,
}

impl InFlightFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&mut self, fence: GpuFence, frames: Vec<RefCountedFrame>) {
        if frames.is_empty() {
            return;
        }
        self.pending.push((fence, frames));
    }

    /// Release every group whose fence is satisfied. Fences may complete
    /// out of order. Returns how many frame references were dropped.
    pub fn collect(&mut self) -> usize {
        let mut released = 0;
        self.pending.retain(|(fence, frames)| {
            if fence.is_satisfied() {
                released += frames.len();
                false
            } else {
                true
            }
        });
        released
    }

    /// Wait for outstanding fences, then release everything that completed.
    /// Groups whose fence never signals are leaked rather than released early.
    pub fn drain(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        for (fence, _) in &self.pending {
            let left = deadline.saturating_duration_since(Instant::now());
            fence.wait_timeout(left);
        }
        let released = self.collect();
        if !self.pending.is_empty() {
            warn!(
                groups = self.pending.len(),
                "GPU fences still pending at shutdown, leaking their input frames"
            );
            for group in self.pending.drain(..) {
                std::mem::forget(group);
            }
        }
        released
    }

    pub fn pending_groups(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.iter().map(|(_, frames)| frames.len()).sum()
    }
}
