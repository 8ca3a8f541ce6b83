//! The synchronizer
//!
//! [`MixerCore`] runs one tick per output frame: pick the master clock, drain
//! one frame from every channel, dispatch audio, upload, render, publish.
//! [`Mixer`] owns the thread that loops over ticks, and [`MixerHandle`] is the
//! cloneable entry point for everything else (GUI commands, status tooling).

use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use flume::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::output::{ComposedFrame, OutputChannel, OutputId};
use super::output_device::OutputDevice;
use super::renderer::{ChannelInput, RenderInput, RenderedOutputs, Renderer};
use crate::audio::{AudioMixer, AudioSink, AudioTask, AudioTaskQueue};
use crate::capture::arrival::ArrivalHandler;
use crate::capture::channel::{CardGroup, ChannelStats};
use crate::capture::driver::CaptureDriver;
use crate::capture::fake::FakeCapture;
use crate::capture::frame::VideoFormat;
use crate::capture::pool::FrameBufferPool;
use crate::capture::queue_policy::{QueueLengthPolicy, QueueObservation};
use crate::error::{CaptureError, MixerError};
use crate::gpu::{InFlightFrames, NullUploader, Uploader};
use crate::{samples_per_duration, Config, MAX_FPS};

/// Settings that may change while the mixer runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerSettings {
    pub master_channel: usize,
    /// Longest a tick waits for the master before giving up
    pub master_timeout: Duration,
    /// Let an attached output device drive the ticks
    pub use_output_device: bool,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            master_channel: 0,
            master_timeout: Duration::from_millis(100),
            use_output_device: true,
        }
    }
}

/// Receives the live output, e.g. an encoder
pub trait FrameSink: Send {
    fn write(&mut self, frame: &ComposedFrame);
}

pub type ConfigChangedCallback = Arc<dyn Fn(&[VideoFormat]) + Send + Sync>;

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Rendered { pts: i64, duration: i64 },
    /// The renderer failed; pts still advanced.
    RenderFailed { pts: i64, duration: i64 },
    /// The master delivered a marker frame; nothing was rendered.
    Skipped { pts: i64, duration: i64 },
    /// No master frame within the timeout; nothing was drained.
    MasterStalled,
    Quit,
}

enum MixerCommand {
    ReplaceChannel {
        channel: usize,
        driver: Box<dyn CaptureDriver>,
    },
}

struct CaptureSlot {
    driver: Option<Box<dyn CaptureDriver>>,
    pool: FrameBufferPool,
}

struct CaptureSet {
    slots: Vec<CaptureSlot>,
    buffer_count: usize,
}

impl CaptureSet {
    /// Stop whatever feeds `channel`, then wire up and start `driver`.
    fn install(
        &mut self,
        channel: usize,
        mut driver: Box<dyn CaptureDriver>,
        group: &Arc<CardGroup>,
        audio: &Arc<AudioMixer>,
    ) -> Result<(), CaptureError> {
        let buffer_count = self.buffer_count;
        let slot = &mut self.slots[channel];
        if let Some(mut old) = slot.driver.take() {
            old.stop();
        }

        let needed = driver.nominal_format().expected_len();
        if slot.pool.buffer_size() < needed {
            slot.pool = FrameBufferPool::new(buffer_count, needed);
        }
        driver.set_allocator(slot.pool.clone());
        driver.set_frame_callback(ArrivalHandler::new(channel, group.clone(), audio.clone()));
        info!(card = channel, "Using {}", driver.description());
        driver.start()?;
        slot.driver = Some(driver);
        Ok(())
    }

    fn stop_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(driver) = slot.driver.as_mut() {
                driver.stop();
            }
        }
    }
}

struct Shared {
    group: Arc<CardGroup>,
    audio: Arc<AudioMixer>,
    outputs: Vec<OutputChannel>,
    settings: ArcSwap<MixerSettings>,
    captures: Mutex<CaptureSet>,
    commands: Sender<MixerCommand>,
    config_changed: Mutex<Option<ConfigChangedCallback>>,
}

impl Shared {
    fn captures(&self) -> MutexGuard<'_, CaptureSet> {
        self.captures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_config_changed(&self, formats: &[VideoFormat]) {
        let callback = self
            .config_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(formats);
        }
    }
}

/// Cloneable access to a mixer from any thread
#[derive(Clone)]
pub struct MixerHandle {
    shared: Arc<Shared>,
}

impl MixerHandle {
    pub fn num_channels(&self) -> usize {
        self.shared.group.num_channels()
    }

    pub fn outputs(&self) -> &[OutputChannel] {
        &self.shared.outputs
    }

    pub fn output(&self, id: OutputId) -> Option<&OutputChannel> {
        self.shared.outputs.get(id.index())
    }

    /// Newest frame of an output, or `None` if it never produced one.
    pub fn get_published_frame(&self, id: OutputId) -> Option<ComposedFrame> {
        self.output(id).and_then(OutputChannel::consume)
    }

    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        self.shared.group.stats()
    }

    pub fn audio_mixer(&self) -> &Arc<AudioMixer> {
        &self.shared.audio
    }

    pub fn card_group(&self) -> &Arc<CardGroup> {
        &self.shared.group
    }

    pub fn settings(&self) -> Arc<MixerSettings> {
        self.shared.settings.load_full()
    }

    pub fn set_master_channel(&self, channel: usize) -> Result<(), MixerError> {
        let num_channels = self.num_channels();
        if channel >= num_channels {
            return Err(MixerError::MasterOutOfRange {
                master: channel,
                num_channels,
            });
        }
        self.shared.settings.rcu(|s| MixerSettings {
            master_channel: channel,
            ..MixerSettings::clone(s)
        });
        info!(card = channel, "Master clock changed");
        Ok(())
    }

    pub fn set_use_output_device(&self, enabled: bool) {
        self.shared.settings.rcu(|s| MixerSettings {
            use_output_device: enabled,
            ..MixerSettings::clone(s)
        });
    }

    pub fn set_config_changed_callback(&self, callback: Option<ConfigChangedCallback>) {
        *self
            .shared
            .config_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = callback;
    }

    /// Hot-plug `driver` into an existing channel slot. Takes effect at the
    /// start of the next tick.
    pub fn replace_channel(
        &self,
        channel: usize,
        driver: Box<dyn CaptureDriver>,
    ) -> Result<(), MixerError> {
        let num_channels = self.num_channels();
        if channel >= num_channels {
            return Err(MixerError::ChannelOutOfRange {
                channel,
                num_channels,
            });
        }
        let command = MixerCommand::ReplaceChannel { channel, driver };
        if self.shared.commands.send(command).is_err() {
            warn!(card = channel, "Mixer already stopped, dropping replacement device");
        }
        self.shared.group.notify(channel);
        Ok(())
    }
}

enum ChannelSource {
    Driver(Box<dyn CaptureDriver>),
    /// Fed by the caller through [`MixerCore::arrival_handler`]
    External(VideoFormat),
}

pub struct MixerBuilder {
    channels: Vec<ChannelSource>,
    settings: MixerSettings,
    num_aux_outputs: usize,
    target_delay_ms: u32,
    buffer_count: usize,
    fence_timeout: Duration,
    cpu_affinity: Option<usize>,
    renderer: Box<dyn Renderer>,
    uploader: Box<dyn Uploader>,
    output_device: Option<Box<dyn OutputDevice>>,
    frame_sink: Option<Box<dyn FrameSink>>,
    audio_sinks: Vec<Box<dyn AudioSink>>,
}

impl MixerBuilder {
    pub fn new(renderer: Box<dyn Renderer>) -> Self {
        let defaults = Config::default();
        Self {
            channels: Vec::new(),
            settings: MixerSettings::default(),
            num_aux_outputs: defaults.mixer.num_aux_outputs,
            target_delay_ms: defaults.audio.target_delay_ms,
            buffer_count: defaults.capture.buffer_count,
            fence_timeout: Duration::from_millis(defaults.mixer.fence_timeout_ms),
            cpu_affinity: None,
            renderer,
            uploader: Box::new(NullUploader::default()),
            output_device: None,
            frame_sink: None,
            audio_sinks: Vec::new(),
        }
    }

    /// Take every tunable from `config`. Channels are added separately.
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = MixerSettings {
            master_channel: config.mixer.master_channel,
            master_timeout: Duration::from_millis(config.mixer.master_timeout_ms),
            use_output_device: config.mixer.output_device,
        };
        self.num_aux_outputs = config.mixer.num_aux_outputs;
        self.target_delay_ms = config.audio.target_delay_ms;
        self.buffer_count = config.capture.buffer_count;
        self.fence_timeout = Duration::from_millis(config.mixer.fence_timeout_ms);
        self.cpu_affinity = config.mixer.cpu_affinity;
        self
    }

    pub fn settings(mut self, settings: MixerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn num_aux_outputs(mut self, n: usize) -> Self {
        self.num_aux_outputs = n;
        self
    }

    pub fn channel(mut self, driver: Box<dyn CaptureDriver>) -> Self {
        self.channels.push(ChannelSource::Driver(driver));
        self
    }

    pub fn external_channel(mut self, format: VideoFormat) -> Self {
        self.channels.push(ChannelSource::External(format));
        self
    }

    pub fn uploader(mut self, uploader: Box<dyn Uploader>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn output_device(mut self, device: Box<dyn OutputDevice>) -> Self {
        self.output_device = Some(device);
        self
    }

    pub fn frame_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.frame_sink = Some(sink);
        self
    }

    pub fn audio_sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.audio_sinks.push(sink);
        self
    }

    /// Build the core and start its capture drivers, without a mixer thread.
    pub fn build_core(self) -> Result<MixerCore, MixerError> {
        let num_channels = self.channels.len();
        if num_channels == 0 {
            return Err(MixerError::NoChannels);
        }
        if self.settings.master_channel >= num_channels {
            return Err(MixerError::MasterOutOfRange {
                master: self.settings.master_channel,
                num_channels,
            });
        }

        let group = CardGroup::new(num_channels);
        let audio = Arc::new(AudioMixer::new(num_channels, self.target_delay_ms)?);
        let audio_tasks = AudioTaskQueue::start(audio.clone(), self.audio_sinks)?;

        let mut formats = Vec::with_capacity(num_channels);
        let mut drivers = Vec::new();
        for (channel, source) in self.channels.into_iter().enumerate() {
            match source {
                ChannelSource::Driver(driver) => {
                    formats.push(driver.nominal_format());
                    drivers.push((channel, driver));
                }
                ChannelSource::External(format) => formats.push(format),
            }
        }

        let slots = formats
            .iter()
            .map(|format| CaptureSlot {
                driver: None,
                pool: FrameBufferPool::new(self.buffer_count, format.expected_len()),
            })
            .collect();
        let (commands_tx, commands_rx) = flume::unbounded();

        let shared = Arc::new(Shared {
            group: group.clone(),
            audio: audio.clone(),
            outputs: (0..2 + self.num_aux_outputs)
                .map(|i| OutputChannel::new(OutputId::from_index(i)))
                .collect(),
            settings: ArcSwap::from_pointee(self.settings),
            captures: Mutex::new(CaptureSet {
                slots,
                buffer_count: self.buffer_count,
            }),
            commands: commands_tx,
            config_changed: Mutex::new(None),
        });

        {
            let mut captures = shared.captures();
            for (channel, driver) in drivers {
                captures
                    .install(channel, driver, &group, &audio)
                    .map_err(|source| MixerError::Capture { channel, source })?;
            }
        }

        info!(
            channels = num_channels,
            outputs = shared.outputs.len(),
            output_device = self.output_device.is_some(),
            "Mixer core ready"
        );

        Ok(MixerCore {
            shared,
            commands: commands_rx,
            audio_tasks,
            renderer: self.renderer,
            uploader: self.uploader,
            output_device: self.output_device,
            frame_sink: self.frame_sink,
            policies: (0..num_channels).map(QueueLengthPolicy::new).collect(),
            latest: vec![None; num_channels],
            formats,
            in_flight: InFlightFrames::new(),
            card_labels: (0..num_channels).map(|c| c.to_string()).collect(),
            pts: 0,
            ticks: 0,
            stalled_ticks: 0,
            fence_timeout: self.fence_timeout,
            cpu_affinity: self.cpu_affinity,
        })
    }

    pub fn start(self) -> Result<Mixer, MixerError> {
        Mixer::start(self.build_core()?)
    }
}

/// Tick state; lives on the mixer thread
pub struct MixerCore {
    shared: Arc<Shared>,
    commands: Receiver<MixerCommand>,
    audio_tasks: AudioTaskQueue,
    renderer: Box<dyn Renderer>,
    uploader: Box<dyn Uploader>,
    output_device: Option<Box<dyn OutputDevice>>,
    frame_sink: Option<Box<dyn FrameSink>>,
    policies: Vec<QueueLengthPolicy>,
    latest: Vec<Option<ChannelInput>>,
    formats: Vec<VideoFormat>,
    in_flight: InFlightFrames,
    card_labels: Vec<String>,
    pts: i64,
    ticks: u64,
    stalled_ticks: u64,
    fence_timeout: Duration,
    cpu_affinity: Option<usize>,
}

impl MixerCore {
    pub fn handle(&self) -> MixerHandle {
        MixerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Presentation time of the next tick.
    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn in_flight(&self) -> &InFlightFrames {
        &self.in_flight
    }

    pub fn safe_queue_length(&self, channel: usize) -> Option<u32> {
        self.policies.get(channel).map(QueueLengthPolicy::safe_queue_length)
    }

    /// A callback that feeds `channel` directly, for sources without a driver.
    pub fn arrival_handler(&self, channel: usize) -> ArrivalHandler {
        ArrivalHandler::new(channel, self.shared.group.clone(), self.shared.audio.clone())
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.in_flight.collect();
        let idle = self.handle_hotplug();

        let group = self.shared.group.clone();
        if group.should_quit() {
            return TickOutcome::Quit;
        }

        let settings = self.shared.settings.load_full();
        let num_channels = group.num_channels();
        let master = settings.master_channel.min(num_channels - 1);

        // Step 1: pace on the output device, or wait for the master channel.
        let slot = match self.output_device.as_mut() {
            Some(device) if settings.use_output_device => Some(device.wait_for_next_slot(self.pts)),
            _ => None,
        };
        let output_is_master = slot.is_some();

        let mut queues = group.lock();
        if !output_is_master {
            let (guard, timed_out) = group.wait_for_frame(queues, master, settings.master_timeout);
            queues = guard;
            if group.should_quit() {
                return TickOutcome::Quit;
            }
            if timed_out || queues[master].frames.is_empty() {
                drop(queues);
                return self.master_stalled(master, timed_out);
            }
        } else if group.should_quit() {
            return TickOutcome::Quit;
        }
        if self.stalled_ticks > 0 {
            info!(card = master, stalled_ticks = self.stalled_ticks, "Master clock recovered");
            self.stalled_ticks = 0;
        }

        // Step 2: one frame from every channel.
        let mut drained = Vec::with_capacity(num_channels);
        let mut trimmed = Vec::new();
        for (channel, queue) in queues.iter_mut().enumerate() {
            let entry = queue.frames.pop_front();
            let counters = group.counters(channel);

            if !(channel == master && !output_is_master) {
                let policy = &mut self.policies[channel];
                if idle[channel] {
                    policy.update(QueueObservation::Idle);
                } else {
                    match entry {
                        Some(_) => policy.update(QueueObservation::Available {
                            depth: queue.frames.len(),
                        }),
                        None => {
                            policy.update(QueueObservation::Starved);
                            counters.starvations.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("apollo_input_starved", "card" => self.card_labels[channel].clone())
                                .increment(1);
                        }
                    }
                    let excess = policy.excess(queue.frames.len());
                    if excess > 0 {
                        trimmed.extend(queue.frames.drain(..excess));
                        counters
                            .frames_trimmed
                            .fetch_add(excess as u64, Ordering::Relaxed);
                        metrics::counter!("apollo_input_queue_trimmed", "card" => self.card_labels[channel].clone())
                            .increment(excess as u64);
                    }
                }
                let safe_length = policy.safe_queue_length();
                counters.safe_queue_length.store(safe_length, Ordering::Relaxed);
                metrics::gauge!("apollo_safe_queue_length", "card" => self.card_labels[channel].clone())
                    .set(f64::from(safe_length));
            }
            counters.queue_depth.store(queue.frames.len(), Ordering::Relaxed);
            drained.push(entry);
        }
        drop(queues);
        if !trimmed.is_empty() {
            debug!(frames = trimmed.len(), "Dropped excess queued frames");
        }
        drop(trimmed);

        let mut config_changed = false;
        for (channel, entry) in drained.iter().enumerate() {
            if let Some(entry) = entry {
                if entry.format != self.formats[channel] {
                    info!(
                        card = channel,
                        width = entry.format.width,
                        height = entry.format.height,
                        has_signal = entry.format.has_signal,
                        "Input format changed"
                    );
                    self.formats[channel] = entry.format;
                    config_changed = true;
                }
            }
        }
        if config_changed {
            self.shared.notify_config_changed(&self.formats);
        }

        let (dropped_frames, duration) = match (slot, drained[master].as_ref()) {
            (Some(slot), _) => (slot.dropped_frames, slot.frame_duration),
            (None, Some(entry)) => (entry.dropped_frames, entry.length),
            // The master queue was non-empty under the lock.
            (None, None) => return TickOutcome::MasterStalled,
        };

        // Audio follows every elapsed frame, including ones skipped below.
        self.schedule_audio(dropped_frames, duration);

        // Step 3: a corrupted master frame is skipped, never fabricated.
        if !output_is_master && drained[master].as_ref().is_some_and(|e| e.is_marker()) {
            let pts = self.pts;
            self.pts += duration;
            self.ticks += 1;
            metrics::counter!("apollo_mixer_ticks").increment(1);
            metrics::counter!("apollo_mixer_dropped_ticks").increment(1);
            debug!(pts, duration, "Master delivered no picture, skipping tick");
            return TickOutcome::Skipped { pts, duration };
        }

        // Step 4: uploads, each exactly once.
        for (channel, entry) in drained.into_iter().enumerate() {
            let Some(mut entry) = entry else { continue };
            if entry.is_marker() {
                continue;
            }
            if let Some(job) = entry.upload.take() {
                if let Err(e) = self.uploader.upload(channel, &entry.frame, &job) {
                    warn!(card = channel, "Upload failed, keeping previous frame: {e}");
                    continue;
                }
            }
            self.latest[channel] = Some(ChannelInput {
                frame: entry.frame,
                format: entry.format,
                field: entry.field,
            });
        }

        // Step 5: render and publish.
        let pts = self.pts;
        let started = Instant::now();
        let result = self.renderer.render(&RenderInput {
            pts,
            duration,
            channels: &self.latest,
        });
        metrics::histogram!("apollo_render_time_us").record(started.elapsed().as_micros() as f64);

        let outcome = match result {
            Ok(rendered) => {
                self.publish(rendered, pts, duration, output_is_master);
                TickOutcome::Rendered { pts, duration }
            }
            Err(e) => {
                warn!(pts, "Render failed: {e}");
                TickOutcome::RenderFailed { pts, duration }
            }
        };

        self.pts += duration;
        self.ticks += 1;
        metrics::counter!("apollo_mixer_ticks").increment(1);
        outcome
    }

    fn master_stalled(&mut self, master: usize, timed_out: bool) -> TickOutcome {
        self.stalled_ticks += 1;
        if self.stalled_ticks == 1 {
            warn!(card = master, timed_out, "No frame from master clock");
        }
        TickOutcome::MasterStalled
    }

    /// One task per elapsed frame; only the real one may steer the rate.
    fn schedule_audio(&mut self, dropped_frames: u32, duration: i64) {
        let num_samples = samples_per_duration(duration);
        let dropped_frames = if dropped_frames > MAX_FPS * 2 {
            warn!(dropped_frames, "Implausible drop count, not back-filling audio");
            0
        } else {
            dropped_frames
        };

        for _ in 0..dropped_frames {
            self.audio_tasks.push(AudioTask {
                pts: self.pts,
                num_samples,
                adjust_rate: false,
            });
            self.pts += duration;
        }
        self.audio_tasks.push(AudioTask {
            pts: self.pts,
            num_samples,
            adjust_rate: true,
        });
    }

    fn publish(&mut self, rendered: RenderedOutputs, pts: i64, duration: i64, output_is_master: bool) {
        let RenderedOutputs {
            outputs,
            fence,
            input_frames,
        } = rendered;

        for output in outputs {
            let frame = ComposedFrame {
                texture: output.texture,
                width: output.width,
                height: output.height,
                pts,
                duration,
                fence: fence.clone(),
                input_frames: input_frames.clone(),
                pixels: output.pixels,
            };
            if output.id == OutputId::Live {
                if output_is_master {
                    if let Some(device) = self.output_device.as_mut() {
                        device.submit(&frame, pts, duration);
                    }
                }
                if let Some(sink) = self.frame_sink.as_mut() {
                    sink.write(&frame);
                }
            }
            match self.shared.outputs.get(output.id.index()) {
                Some(channel) => channel.publish(frame),
                None => debug!(output = %output.id, "Renderer produced an output nobody listens to"),
            }
        }
        self.in_flight.retain(fence, input_frames);
    }

    /// Apply queued replacements and swap unplugged devices for fake ones.
    /// Returns which channels were reset and should not feed their policy.
    fn handle_hotplug(&mut self) -> Vec<bool> {
        let group = self.shared.group.clone();
        let mut reset = vec![false; group.num_channels()];

        while let Ok(MixerCommand::ReplaceChannel { channel, driver }) = self.commands.try_recv() {
            info!(card = channel, "Replacing capture device");
            self.replace(channel, driver);
            reset[channel] = true;
        }

        let disconnected: Vec<usize> = {
            let queues = group.lock();
            queues
                .iter()
                .enumerate()
                .filter(|(_, q)| q.disconnected)
                .map(|(channel, _)| channel)
                .collect()
        };
        for channel in disconnected {
            let format = VideoFormat {
                has_signal: false,
                ..self.formats[channel]
            };
            warn!(card = channel, "Device gone, substituting a fake source");
            self.replace(
                channel,
                Box::new(FakeCapture::new(format!("stand-in {channel}"), format)),
            );
            reset[channel] = true;
        }
        reset
    }

    fn replace(&mut self, channel: usize, driver: Box<dyn CaptureDriver>) {
        let group = self.shared.group.clone();
        let audio = self.shared.audio.clone();
        let format = driver.nominal_format();
        {
            let mut captures = self.shared.captures();
            if group.should_quit() {
                return;
            }
            if let Some(mut old) = captures.slots[channel].driver.take() {
                old.stop();
            }
            group.reset_channel(channel);
            audio.reset_resampler(channel);
            if let Err(e) = captures.install(channel, driver, &group, &audio) {
                error!(card = channel, "Replacement device failed to start: {e}");
            }
        }
        self.policies[channel].reset();
        self.formats[channel] = format;
        self.shared.notify_config_changed(&self.formats);
    }

    /// Loop until quit is requested.
    pub fn run(mut self) -> Self {
        if let Some(cpu) = self.cpu_affinity {
            pin_to_cpu(cpu);
        }
        info!("Mixer thread running");
        while self.tick() != TickOutcome::Quit {}
        info!(ticks = self.ticks, pts = self.pts, "Mixer thread stopping");
        self
    }

    /// Stop capture, wait for outstanding renders, then stop the audio worker.
    pub fn shutdown(mut self) {
        self.shared.captures().stop_all();
        let released = self.in_flight.drain(self.fence_timeout);
        debug!(released, "Released in-flight input frames");
        self.audio_tasks.shutdown();
    }
}

fn pin_to_cpu(cpu: usize) {
    let core = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|core| core.id == cpu);
    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            info!(cpu, "Pinned mixer thread");
        }
        Some(_) => warn!(cpu, "Failed to pin mixer thread"),
        None => warn!(cpu, "No such CPU, mixer thread left unpinned"),
    }
}

/// Owns the mixer thread
pub struct Mixer {
    handle: MixerHandle,
    thread: Option<JoinHandle<MixerCore>>,
}

impl Mixer {
    pub fn start(core: MixerCore) -> Result<Self, MixerError> {
        let handle = core.handle();
        let thread = thread::Builder::new()
            .name("mixer".into())
            .spawn(move || core.run())
            .map_err(|source| MixerError::ThreadSpawn {
                name: "mixer",
                source,
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &MixerHandle {
        &self.handle
    }

    /// Signal quit, stop capture, join the mixer thread, then let pending
    /// renders finish and stop the audio worker.
    pub fn quit(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        info!("Shutting down mixer");
        let shared = &self.handle.shared;
        shared.group.request_quit();
        shared.captures().stop_all();
        match thread.join() {
            Ok(core) => core.shutdown(),
            Err(_) => error!("Mixer thread panicked"),
        }
    }
}

impl Deref for Mixer {
    type Target = MixerHandle;

    fn deref(&self) -> &MixerHandle {
        &self.handle
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
