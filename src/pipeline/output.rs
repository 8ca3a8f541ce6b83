//! Latest-wins hand-off between the mixer and its consumers
//!
//! Each output holds at most two frames: the one a consumer last took
//! ("current") and the newest one nobody has taken yet ("ready"). A newer
//! ready frame replaces an untaken one, so slow consumers skip frames instead
//! of building a queue.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::frame::RefCountedFrame;
use crate::gpu::{GpuFence, GpuHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputId {
    Live,
    Preview,
    Aux(usize),
}

impl OutputId {
    /// Position in the mixer's output list.
    pub fn index(self) -> usize {
        match self {
            OutputId::Live => 0,
            OutputId::Preview => 1,
            OutputId::Aux(n) => 2 + n,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index {
            0 => OutputId::Live,
            1 => OutputId::Preview,
            n => OutputId::Aux(n - 2),
        }
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputId::Live => f.write_str("live"),
            OutputId::Preview => f.write_str("preview"),
            OutputId::Aux(n) => write!(f, "aux{n}"),
        }
    }
}

/// One composed output picture and everything that must outlive it
#[derive(Debug, Clone)]
pub struct ComposedFrame {
    pub texture: GpuHandle,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
    pub duration: i64,
    /// Satisfied once the GPU finished producing `texture`
    pub fence: GpuFence,
    /// Inputs the texture was composed from, kept alive with it
    pub input_frames: Vec<RefCountedFrame>,
    /// CPU copy of the picture, if the renderer produced one
    pub pixels: Option<Bytes>,
}

pub type FrameReadyCallback = Arc<dyn Fn(OutputId) + Send + Sync>;

#[derive(Default)]
struct Slots {
    current: Option<ComposedFrame>,
    ready: Option<ComposedFrame>,
    published: u64,
    superseded: u64,
}

pub struct OutputChannel {
    id: OutputId,
    slots: Mutex<Slots>,
    callbacks: Mutex<Vec<(String, FrameReadyCallback)>>,
}

impl OutputChannel {
    pub fn new(id: OutputId) -> Self {
        Self {
            id,
            slots: Mutex::new(Slots::default()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn callbacks(&self) -> MutexGuard<'_, Vec<(String, FrameReadyCallback)>> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `frame` as the ready frame, releasing an untaken predecessor.
    pub fn publish(&self, frame: ComposedFrame) {
        let evicted = {
            let mut slots = self.slots();
            slots.published += 1;
            let evicted = slots.ready.replace(frame);
            if evicted.is_some() {
                slots.superseded += 1;
            }
            evicted
        };
        if let Some(old) = evicted {
            debug!(output = %self.id, pts = old.pts, "Releasing frame nobody consumed");
        }

        let callbacks: Vec<FrameReadyCallback> =
            self.callbacks().iter().map(|(_, cb)| cb.clone()).collect();
        for cb in callbacks {
            cb(self.id);
        }
    }

    /// Promote the ready frame (if any) and return the current one.
    ///
    /// Returns `None` only if nothing was ever published.
    pub fn consume(&self) -> Option<ComposedFrame> {
        let mut slots = self.slots();
        let mut released = None;
        if let Some(ready) = slots.ready.take() {
            released = slots.current.replace(ready);
        }
        let current = slots.current.clone();
        drop(slots);
        drop(released);
        current
    }

    pub fn has_ready_frame(&self) -> bool {
        self.slots().ready.is_some()
    }

    /// Frames currently held, never more than two.
    pub fn live_frames(&self) -> usize {
        let slots = self.slots();
        usize::from(slots.current.is_some()) + usize::from(slots.ready.is_some())
    }

    /// (published, superseded before anyone consumed them)
    pub fn counts(&self) -> (u64, u64) {
        let slots = self.slots();
        (slots.published, slots.superseded)
    }

    pub fn add_frame_ready_callback(&self, key: impl Into<String>, callback: FrameReadyCallback) {
        let key = key.into();
        let mut callbacks = self.callbacks();
        callbacks.retain(|(k, _)| *k != key);
        callbacks.push((key, callback));
    }

    pub fn remove_frame_ready_callback(&self, key: &str) {
        self.callbacks().retain(|(k, _)| k != key);
    }
}

impl fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputChannel")
            .field("id", &self.id)
            .field("live_frames", &self.live_frames())
            .finish()
    }
}
