#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use apollo_mixer::audio::{AudioSink, AudioTask};
use apollo_mixer::capture::{Frame, FrameArrival, FrameBufferPool, RefCountedFrame, VideoFormat};
use apollo_mixer::error::{RenderError, UploadError};
use apollo_mixer::gpu::{GpuFence, HandlePool, UploadJob, Uploader};
use apollo_mixer::pipeline::{
    MixerBuilder, MixerCore, MixerSettings, OutputId, RenderInput, RenderedOutput,
    RenderedOutputs, Renderer,
};

/// 8x4 UYVY at 60 fps: 64-byte frames, 2000 ticks long
pub fn small_format() -> VideoFormat {
    VideoFormat {
        width: 8,
        height: 4,
        frame_rate_nom: 60,
        frame_rate_den: 1,
        ..Default::default()
    }
}

pub fn good_frame(pool: &FrameBufferPool, timecode: u16) -> FrameArrival {
    let format = small_format();
    match pool.try_alloc() {
        Some(mut buf) => {
            buf.fill_with(0x80, format.expected_len());
            FrameArrival {
                timecode,
                video: Frame::new(buf, Instant::now()),
                audio: None,
                format,
            }
        }
        None => FrameArrival::empty(timecode, format),
    }
}

/// A frame whose payload does not match its declared geometry.
pub fn corrupted_frame(pool: &FrameBufferPool, timecode: u16) -> FrameArrival {
    let mut arrival = FrameArrival::empty(timecode, small_format());
    if let Some(mut buf) = pool.try_alloc() {
        buf.fill_with(0x10, 10);
        arrival.video = Frame::new(buf, Instant::now());
    }
    arrival
}

pub fn core_with(renderer: Box<dyn Renderer>, channels: usize) -> MixerCore {
    builder_with(renderer, channels).build_core().unwrap()
}

pub fn builder_with(renderer: Box<dyn Renderer>, channels: usize) -> MixerBuilder {
    let mut builder = MixerBuilder::new(renderer).settings(MixerSettings {
        master_timeout: Duration::from_millis(20),
        ..Default::default()
    });
    for _ in 0..channels {
        builder = builder.external_channel(small_format());
    }
    builder
}

/// What the scripted renderer saw
#[derive(Clone, Default)]
pub struct RenderLog {
    pub calls: Arc<AtomicUsize>,
    /// Fence of every render and the pool slots it read
    pub fences: Arc<Mutex<Vec<(GpuFence, Vec<usize>)>>>,
    /// Per render, which channels had a frame
    pub inputs: Arc<Mutex<Vec<Vec<bool>>>>,
}

impl RenderLog {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Publishes to Live only; fences are either pre-signaled or left to the test.
pub struct ScriptedRenderer {
    textures: HandlePool,
    log: RenderLog,
    signal_immediately: bool,
}

impl ScriptedRenderer {
    pub fn signaled() -> (Box<dyn Renderer>, RenderLog) {
        Self::build(true)
    }

    pub fn deferred() -> (Box<dyn Renderer>, RenderLog) {
        Self::build(false)
    }

    fn build(signal_immediately: bool) -> (Box<dyn Renderer>, RenderLog) {
        let log = RenderLog::default();
        let renderer = ScriptedRenderer {
            textures: HandlePool::new("scripted"),
            log: log.clone(),
            signal_immediately,
        };
        (Box::new(renderer), log)
    }
}

impl Renderer for ScriptedRenderer {
    fn render(&mut self, input: &RenderInput<'_>) -> Result<RenderedOutputs, RenderError> {
        self.log.calls.fetch_add(1, Ordering::SeqCst);
        let input_frames: Vec<RefCountedFrame> = input
            .channels
            .iter()
            .flatten()
            .map(|c| c.frame.clone())
            .collect();
        let fence = if self.signal_immediately {
            GpuFence::signaled()
        } else {
            GpuFence::new()
        };
        self.log.fences.lock().unwrap().push((
            fence.clone(),
            input_frames.iter().filter_map(|f| f.slot()).collect(),
        ));
        self.log
            .inputs
            .lock()
            .unwrap()
            .push(input.channels.iter().map(Option::is_some).collect());

        Ok(RenderedOutputs {
            outputs: vec![RenderedOutput {
                id: OutputId::Live,
                texture: self.textures.alloc(),
                width: 8,
                height: 4,
                pixels: None,
            }],
            fence,
            input_frames,
        })
    }
}

#[derive(Clone, Default)]
pub struct UploadLog(pub Arc<Mutex<Vec<(usize, UploadJob)>>>);

impl UploadLog {
    pub fn for_channel(&self, channel: usize) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == channel)
            .count()
    }
}

pub struct CountingUploader(pub UploadLog);

impl Uploader for CountingUploader {
    fn upload(
        &mut self,
        channel: usize,
        _frame: &RefCountedFrame,
        job: &UploadJob,
    ) -> Result<(), UploadError> {
        self.0 .0.lock().unwrap().push((channel, *job));
        Ok(())
    }
}

/// Records every audio task the worker processed.
pub struct TaskLog(pub Arc<Mutex<Vec<AudioTask>>>);

impl AudioSink for TaskLog {
    fn write(&mut self, task: &AudioTask, samples: &[f32]) {
        assert_eq!(samples.len(), task.num_samples * 2);
        self.0.lock().unwrap().push(*task);
    }
}

/// Deterministic xorshift64 for randomized scenarios
pub struct XorShift(pub u64);

impl XorShift {
    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn chance(&mut self, percent: u64) -> bool {
        self.next() % 100 < percent
    }
}
