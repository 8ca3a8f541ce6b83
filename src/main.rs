//! Apollo live mixer: capture sources in, live/preview/aux outputs out

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use apollo_mixer::audio::audio_ring;
use apollo_mixer::capture::{CaptureDriver, FakeCapture, VideoFormat};
use apollo_mixer::pipeline::{CutControl, CutRenderer, MixerBuilder, OutputId, PacedOutput};
use apollo_mixer::{CaptureKind, ChannelConfig, Config, OUTPUT_FREQUENCY};
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("apollo_mixer=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("Apollo mixer launching...");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    if config.capture.channels.is_empty() {
        return Err(eyre!("no capture channels configured"));
    }
    let num_channels = config.capture.channels.len();
    let house_format = config.capture.channels[0].format;

    let control = CutControl::new(0, 1 % num_channels);
    let renderer = CutRenderer::new(control.clone(), config.mixer.num_aux_outputs, house_format);
    let mut builder = MixerBuilder::new(Box::new(renderer)).config(&config);
    for (index, channel) in config.capture.channels.iter().enumerate() {
        builder = builder.channel(make_driver(index, channel)?);
    }

    let output_counters = if config.mixer.output_device {
        let output = PacedOutput::new(house_format);
        let counters = output.counters();
        builder = builder.output_device(Box::new(output));
        Some(counters)
    } else {
        None
    };

    let (audio_sink, mut audio_reader) = audio_ring(config.audio.ring_capacity);
    builder = builder.audio_sink(Box::new(audio_sink));

    let mixer = builder.start()?;
    mixer.set_config_changed_callback(Some(Arc::new(|formats: &[VideoFormat]| {
        for (card, format) in formats.iter().enumerate() {
            info!(
                card,
                width = format.width,
                height = format.height,
                has_signal = format.has_signal,
                "Channel configuration"
            );
        }
    })));

    // Stand-in for a sound card: pull 10 ms of audio every 10 ms.
    let mut playback = tokio::time::interval(Duration::from_millis(10));
    let mut playback_buf = vec![0.0f32; OUTPUT_FREQUENCY as usize / 100 * 2];
    let mut stats = tokio::time::interval(Duration::from_secs(5));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = playback.tick() => {
                audio_reader.read(&mut playback_buf);
            }
            _ = stats.tick() => {
                for (card, s) in mixer.channel_stats().iter().enumerate() {
                    info!(
                        card,
                        received = s.frames_received,
                        dropped = s.frames_dropped,
                        corrupted = s.frames_corrupted,
                        trimmed = s.frames_trimmed,
                        starved = s.starvations,
                        safe_length = s.safe_queue_length,
                        depth = s.queue_depth,
                        "Channel stats"
                    );
                }
                if let Some(frame) = mixer.get_published_frame(OutputId::Live) {
                    info!(pts = frame.pts, width = frame.width, height = frame.height, "Live output");
                }
                if let Some(counters) = &output_counters {
                    info!(
                        submitted = counters.submitted.load(Ordering::Relaxed),
                        dropped = counters.dropped.load(Ordering::Relaxed),
                        "Output device"
                    );
                }
                let (written, read, dropped, underruns) = audio_reader.stats();
                info!(written, read, dropped, underruns, "Audio ring");
            }
        }
    }

    info!("Apollo mixer shutting down");
    mixer.quit();
    Ok(())
}

fn make_driver(index: usize, channel: &ChannelConfig) -> Result<Box<dyn CaptureDriver>> {
    match channel.kind {
        CaptureKind::Fake => {
            let luma = 0x20 + 0x30 * (index % 5) as u8;
            Ok(Box::new(
                FakeCapture::new(channel.name.clone(), channel.format).with_luma(luma),
            ))
        }
        #[cfg(feature = "v4l2-capture")]
        CaptureKind::V4l2 => {
            use apollo_mixer::capture::v4l2::{detect_devices, V4l2Capture};
            let path = match &channel.device {
                Some(path) => path.clone(),
                None => detect_devices()
                    .into_iter()
                    .next()
                    .ok_or_else(|| eyre!("no V4L2 capture device found for {}", channel.name))?,
            };
            info!(card = index, "Using capture device: {path}");
            Ok(Box::new(V4l2Capture::new(path, channel.format)))
        }
        #[cfg(not(feature = "v4l2-capture"))]
        CaptureKind::V4l2 => Err(eyre!(
            "channel {} is a V4L2 device; rebuild with --features v4l2-capture",
            channel.name
        )),
    }
}
