//! Per-channel pending-frame queues shared between driver threads and the mixer
//!
//! All queues live behind one mutex; every channel has its own condition
//! variable on that mutex so the mixer can wait on just the master.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

use super::frame::{RefCountedFrame, VideoFormat};
use crate::gpu::upload::UploadJob;

/// One entry of a channel's pending-frame queue
#[derive(Debug)]
pub struct QueuedFrame {
    pub frame: RefCountedFrame,
    pub format: VideoFormat,
    /// Duration in `TIMEBASE` units (half a frame for interlaced fields)
    pub length: i64,
    /// 0 or 1 for interlaced sources, always 0 for progressive ones
    pub field: u8,
    /// Frames lost between the previous entry and this one
    pub dropped_frames: u32,
    /// GPU upload to run on the mixer thread, taken exactly once
    pub upload: Option<UploadJob>,
}

impl QueuedFrame {
    pub fn is_marker(&self) -> bool {
        self.frame.is_empty()
    }
}

/// Queue state guarded by the group lock
#[derive(Debug, Default)]
pub struct ChannelQueue {
    pub frames: VecDeque<QueuedFrame>,
    pub disconnected: bool,
}

/// Counters for one channel, readable from any thread
#[derive(Debug, Default)]
pub struct ChannelCounters {
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_corrupted: AtomicU64,
    pub frames_trimmed: AtomicU64,
    pub starvations: AtomicU64,
    pub safe_queue_length: AtomicU32,
    pub queue_depth: AtomicUsize,
}

/// Snapshot of [`ChannelCounters`] for logging and tooling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_corrupted: u64,
    pub frames_trimmed: u64,
    pub starvations: u64,
    pub safe_queue_length: u32,
    pub queue_depth: usize,
}

impl ChannelCounters {
    pub fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_corrupted: self.frames_corrupted.load(Ordering::Relaxed),
            frames_trimmed: self.frames_trimmed.load(Ordering::Relaxed),
            starvations: self.starvations.load(Ordering::Relaxed),
            safe_queue_length: self.safe_queue_length.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }
}

/// All capture channels of one mixer
pub struct CardGroup {
    queues: Mutex<Vec<ChannelQueue>>,
    new_frames_changed: Vec<Condvar>,
    counters: Vec<CachePadded<ChannelCounters>>,
    should_quit: AtomicBool,
}

pub type CardGroupGuard<'a> = MutexGuard<'a, Vec<ChannelQueue>>;

impl CardGroup {
    pub fn new(num_channels: usize) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new((0..num_channels).map(|_| ChannelQueue::default()).collect()),
            new_frames_changed: (0..num_channels).map(|_| Condvar::new()).collect(),
            counters: (0..num_channels)
                .map(|_| CachePadded::new(ChannelCounters::default()))
                .collect(),
            should_quit: AtomicBool::new(false),
        })
    }

    pub fn num_channels(&self) -> usize {
        self.new_frames_changed.len()
    }

    pub fn lock(&self) -> CardGroupGuard<'_> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn counters(&self, channel: usize) -> &ChannelCounters {
        &self.counters[channel]
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        self.counters.iter().map(|c| c.snapshot()).collect()
    }

    /// Append an entry and wake whoever waits on this channel.
    pub fn push(&self, channel: usize, entry: QueuedFrame) {
        let mut queues = self.lock();
        let queue = &mut queues[channel];
        queue.frames.push_back(entry);
        self.counters[channel]
            .queue_depth
            .store(queue.frames.len(), Ordering::Relaxed);
        drop(queues);
        self.notify(channel);
    }

    pub fn notify(&self, channel: usize) {
        self.new_frames_changed[channel].notify_all();
    }

    pub fn set_disconnected(&self, channel: usize, disconnected: bool) {
        self.lock()[channel].disconnected = disconnected;
        self.notify(channel);
    }

    pub fn is_disconnected(&self, channel: usize) -> bool {
        self.lock()[channel].disconnected
    }

    /// Drop every pending entry of a channel and clear its disconnect flag.
    pub fn reset_channel(&self, channel: usize) {
        let mut queues = self.lock();
        queues[channel].frames.clear();
        queues[channel].disconnected = false;
        self.counters[channel].queue_depth.store(0, Ordering::Relaxed);
    }

    /// Wait until `channel` has a frame, is disconnected, or quit was
    /// requested. Returns the guard and whether the wait timed out.
    pub fn wait_for_frame<'a>(
        &'a self,
        mut guard: CardGroupGuard<'a>,
        channel: usize,
        timeout: Duration,
    ) -> (CardGroupGuard<'a>, bool) {
        let deadline = Instant::now() + timeout;
        loop {
            let queue = &guard[channel];
            if !queue.frames.is_empty() || queue.disconnected || self.should_quit() {
                return (guard, false);
            }
            let now = Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            let (g, _) = self.new_frames_changed[channel]
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }

    pub fn request_quit(&self) {
        self.should_quit.store(true, Ordering::Release);
        for cv in &self.new_frames_changed {
            cv.notify_all();
        }
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit.load(Ordering::Acquire)
    }
}
