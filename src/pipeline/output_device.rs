//! Hardware output seam
//!
//! When an output device is attached it becomes the master clock: every tick
//! starts by asking it for the next slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::output::ComposedFrame;
use crate::capture::frame::VideoFormat;
use crate::TIMEBASE;

/// What the device reported when it became ready for the next frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSlot {
    /// Slots the device had to skip since the previous call
    pub dropped_frames: u32,
    /// Duration of one output frame in `TIMEBASE` units
    pub frame_duration: i64,
}

pub trait OutputDevice: Send {
    fn description(&self) -> String;

    /// Block until the device can take the frame for `target_pts`.
    fn wait_for_next_slot(&mut self, target_pts: i64) -> OutputSlot;

    fn submit(&mut self, frame: &ComposedFrame, pts: i64, duration: i64);
}

#[derive(Debug, Default)]
pub struct OutputCounters {
    pub submitted: AtomicU64,
    pub dropped: AtomicU64,
    pub last_pts: AtomicU64,
}

/// Software output paced by the wall clock, for running without a card
pub struct PacedOutput {
    format: VideoFormat,
    frame_duration: Duration,
    epoch: Option<Instant>,
    next_slot: u64,
    counters: Arc<OutputCounters>,
}

impl PacedOutput {
    pub fn new(format: VideoFormat) -> Self {
        let ticks = format.frame_length();
        Self {
            format,
            frame_duration: Duration::from_nanos((ticks * 1_000_000_000 / TIMEBASE) as u64),
            epoch: None,
            next_slot: 0,
            counters: Arc::new(OutputCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<OutputCounters> {
        self.counters.clone()
    }

    fn slot_deadline(&self, epoch: Instant, slot: u64) -> Instant {
        self.format.frame_deadline(epoch, slot)
    }
}

impl OutputDevice for PacedOutput {
    fn description(&self) -> String {
        format!(
            "Paced software output ({}x{} @ {}/{})",
            self.format.width,
            self.format.height,
            self.format.frame_rate_nom,
            self.format.frame_rate_den
        )
    }

    fn wait_for_next_slot(&mut self, target_pts: i64) -> OutputSlot {
        let now = Instant::now();
        let epoch = *self.epoch.get_or_insert(now);
        let mut deadline = self.slot_deadline(epoch, self.next_slot);

        // Slots already fully in the past are lost.
        let mut dropped = 0u32;
        while deadline + self.frame_duration <= now {
            dropped += 1;
            self.next_slot += 1;
            deadline = self.slot_deadline(epoch, self.next_slot);
        }
        if dropped > 0 {
            warn!(dropped, target_pts, "Output device missed slots");
            self.counters
                .dropped
                .fetch_add(u64::from(dropped), Ordering::Relaxed);
        }

        thread::sleep(deadline.saturating_duration_since(Instant::now()));
        self.next_slot += 1;
        OutputSlot {
            dropped_frames: dropped,
            frame_duration: self.format.frame_length(),
        }
    }

    fn submit(&mut self, frame: &ComposedFrame, pts: i64, _duration: i64) {
        if !frame.fence.is_satisfied() {
            debug!(pts, "Submitting frame whose render has not finished yet");
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_pts
            .store(pts.max(0) as u64, Ordering::Relaxed);
    }
}
