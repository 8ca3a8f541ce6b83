//! Audio reconciliation worker
//!
//! Resampling and mixing run on their own thread so their cost can never
//! delay a video tick. Tasks are processed strictly in the order queued.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use super::mixer::AudioMixer;
use super::resampling_queue::RateAdjustmentPolicy;
use crate::error::MixerError;

/// One frame's worth of audio to pull out of the mixer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTask {
    pub pts: i64,
    pub num_samples: usize,
    /// Whether this frame's timing may steer the resampling rate
    pub adjust_rate: bool,
}

/// Consumer of mixed output audio (sound card, encoder, ...)
pub trait AudioSink: Send {
    fn write(&mut self, task: &AudioTask, samples: &[f32]);
}

pub struct AudioTaskQueue {
    tx: Option<Sender<AudioTask>>,
    worker: Option<JoinHandle<()>>,
}

impl AudioTaskQueue {
    pub fn start(mixer: Arc<AudioMixer>, sinks: Vec<Box<dyn AudioSink>>) -> Result<Self, MixerError> {
        let (tx, rx) = flume::unbounded();
        let worker = thread::Builder::new()
            .name("audio-mixer".into())
            .spawn(move || run_worker(rx, mixer, sinks))
            .map_err(|source| MixerError::ThreadSpawn {
                name: "audio",
                source,
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn push(&self, task: AudioTask) {
        if let Some(tx) = &self.tx {
            if tx.send(task).is_err() {
                warn!("Audio worker gone, dropping audio task");
            }
        }
    }

    /// Tasks queued but not yet picked up.
    pub fn backlog(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }

    /// Let the worker finish what is queued, then join it.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Audio worker panicked");
            }
        }
    }
}

impl Drop for AudioTaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(rx: Receiver<AudioTask>, mixer: Arc<AudioMixer>, mut sinks: Vec<Box<dyn AudioSink>>) {
    info!(sinks = sinks.len(), "Audio worker started");
    let mut processed = 0u64;
    while let Ok(task) = rx.recv() {
        let policy = if task.adjust_rate {
            RateAdjustmentPolicy::AdjustRate
        } else {
            RateAdjustmentPolicy::DoNotAdjustRate
        };
        let samples = mixer.get_output(task.num_samples, policy);
        for sink in sinks.iter_mut() {
            sink.write(&task, &samples);
        }
        processed += 1;
    }
    debug!(processed, "Audio worker stopped");
}
