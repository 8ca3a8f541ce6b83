//! Synthetic capture source
//!
//! Produces flat frames and silence at the nominal rate of its format. Used in
//! place of unplugged devices so every channel index stays valid, and by the
//! demo binary when no hardware is configured.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::arrival::ArrivalHandler;
use super::driver::{AudioBlock, CaptureDriver, FrameArrival};
use super::frame::{Frame, PixelFormat, VideoFormat};
use super::pool::FrameBufferPool;
use crate::audio::convert::AudioFormat;
use crate::error::CaptureError;
use crate::samples_per_duration;

pub struct FakeCapture {
    label: String,
    format: VideoFormat,
    /// Luma level of the generated picture
    luma: u8,
    pool: Option<FrameBufferPool>,
    handler: Option<ArrivalHandler>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FakeCapture {
    pub fn new(label: impl Into<String>, format: VideoFormat) -> Self {
        Self {
            label: label.into(),
            format,
            luma: 0x10,
            pool: None,
            handler: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn with_luma(mut self, luma: u8) -> Self {
        self.luma = luma;
        self
    }
}

impl CaptureDriver for FakeCapture {
    fn description(&self) -> String {
        format!(
            "Fake card {} ({}x{} @ {}/{})",
            self.label,
            self.format.width,
            self.format.height,
            self.format.frame_rate_nom,
            self.format.frame_rate_den
        )
    }

    fn set_allocator(&mut self, pool: FrameBufferPool) {
        self.pool = Some(pool);
    }

    fn set_frame_callback(&mut self, handler: ArrivalHandler) {
        self.handler = Some(handler);
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let mut handler = self.handler.take().ok_or(CaptureError::NoCallback)?;
        let pool = self.pool.clone();
        let format = self.format;
        let luma = self.luma;
        let running = self.running.clone();
        running.store(true, Ordering::Release);

        let samples = samples_per_duration(format.frame_length());
        let audio_format = AudioFormat::default();
        let silence = Bytes::from(vec![0u8; samples * audio_format.bytes_per_frame()]);

        info!(card = handler.channel(), "Starting {}", self.description());
        let worker = thread::Builder::new()
            .name(format!("fake-capture-{}", handler.channel()))
            .spawn(move || {
                let start = Instant::now();
                let mut frame_num: u64 = 0;
                while running.load(Ordering::Acquire) {
                    let deadline = format.frame_deadline(start, frame_num);
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));

                    let timecode = frame_num as u16;
                    let mut arrival = match pool.as_ref().and_then(FrameBufferPool::try_alloc) {
                        Some(mut buf) => {
                            fill_flat(&mut buf, format, luma);
                            FrameArrival {
                                timecode,
                                video: Frame::new(buf, Instant::now()),
                                audio: None,
                                format,
                            }
                        }
                        None => FrameArrival::empty(timecode, format),
                    };
                    arrival.audio = Some(AudioBlock {
                        data: silence.clone(),
                        format: audio_format,
                    });
                    handler.on_frame(arrival);
                    frame_num += 1;
                }
                debug!(card = handler.channel(), frames = frame_num, "Fake capture stopped");
            })
            .map_err(CaptureError::Io)?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(label = %self.label, "Fake capture thread panicked");
            }
        }
    }

    fn nominal_format(&self) -> VideoFormat {
        self.format
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fill_flat(buf: &mut super::pool::PooledBuffer, format: VideoFormat, luma: u8) {
    let len = format.expected_len();
    match format.pixel_format {
        PixelFormat::Uyvy422 => {
            buf.fill_with(0x80, len);
            for px in buf.as_mut_slice().chunks_exact_mut(2) {
                px[1] = luma;
            }
        }
        PixelFormat::Bgra => {
            buf.fill_with(luma, len);
            for px in buf.as_mut_slice().chunks_exact_mut(4) {
                px[3] = 0xff;
            }
        }
        PixelFormat::Nv12 => {
            let luma_len = format.pixel_format.stride(format.width) * format.height as usize;
            buf.fill_with(0x80, len);
            let plane = buf.as_mut_slice();
            let end = luma_len.min(plane.len());
            plane[..end].fill(luma);
        }
        // Flat v210 is not worth packing by hand; the content is never inspected.
        PixelFormat::V210 => buf.fill_with(0, len),
    }
}
