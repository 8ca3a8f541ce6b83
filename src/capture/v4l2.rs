//! V4L2 capture devices
//!
//! Each device gets its own thread that dequeues memory-mapped buffers and
//! copies them into the channel's pool. V4L2 reports no timecode, so the
//! buffer sequence number (truncated to 16 bits) stands in for one.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::arrival::ArrivalHandler;
use super::driver::{CaptureDriver, FrameArrival};
use super::frame::{Frame, PixelFormat, VideoFormat};
use super::pool::FrameBufferPool;
use crate::error::CaptureError;

const STREAM_BUFFERS: u32 = 4;
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

fn fourcc(format: PixelFormat) -> Option<FourCC> {
    match format {
        PixelFormat::Uyvy422 => Some(FourCC::new(b"UYVY")),
        PixelFormat::Bgra => Some(FourCC::new(b"AR24")),
        PixelFormat::Nv12 => Some(FourCC::new(b"NV12")),
        PixelFormat::V210 => None,
    }
}

/// List `/dev/video*` nodes that can capture in one of our pixel formats.
pub fn detect_devices() -> Vec<String> {
    info!("Scanning for V4L2 capture devices");
    let wanted: Vec<FourCC> = [PixelFormat::Uyvy422, PixelFormat::Bgra, PixelFormat::Nv12]
        .into_iter()
        .filter_map(fourcc)
        .collect();

    let mut found = Vec::new();
    for i in 0..16 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        let usable = dev
            .enum_formats()
            .map(|formats| formats.iter().any(|f| wanted.contains(&f.fourcc)))
            .unwrap_or(false);
        if usable {
            info!("Found {} - {}", path, caps.card);
            found.push(path);
        }
    }
    found
}

pub struct V4l2Capture {
    path: String,
    requested: VideoFormat,
    pool: Option<FrameBufferPool>,
    handler: Option<ArrivalHandler>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2Capture {
    pub fn new(path: impl Into<String>, requested: VideoFormat) -> Self {
        Self {
            path: path.into(),
            requested,
            pool: None,
            handler: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Open the device and negotiate the closest format it accepts.
    fn open(&self) -> Result<(Device, VideoFormat), CaptureError> {
        let device = Device::with_path(&self.path)
            .map_err(|_| CaptureError::DeviceNotFound(self.path.clone()))?;
        let caps = device.query_caps()?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} cannot capture video",
                self.path
            )));
        }
        info!(path = %self.path, "Device: {} ({})", caps.card, caps.driver);

        let wanted = fourcc(self.requested.pixel_format).ok_or_else(|| {
            CaptureError::UnsupportedFormat(format!("{:?}", self.requested.pixel_format))
        })?;
        let mut fmt = device.format()?;
        fmt.width = self.requested.width;
        fmt.height = self.requested.height;
        fmt.fourcc = wanted;
        let fmt = device.set_format(&fmt)?;
        if fmt.fourcc != wanted {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} refused {}",
                self.path, wanted
            )));
        }

        let mut format = VideoFormat {
            width: fmt.width,
            height: fmt.height,
            ..self.requested
        };
        // The interval is seconds per frame.
        if let Ok(params) = device.params() {
            if params.interval.numerator > 0 && params.interval.denominator > 0 {
                format.frame_rate_nom = params.interval.denominator;
                format.frame_rate_den = params.interval.numerator;
            }
        }
        Ok((device, format))
    }
}

impl CaptureDriver for V4l2Capture {
    fn description(&self) -> String {
        format!(
            "V4L2 device {} ({}x{})",
            self.path, self.requested.width, self.requested.height
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
        let (device, format) = self.open()?;
        let mut handler = self.handler.take().ok_or(CaptureError::NoCallback)?;
        let pool = self.pool.clone();
        let running = self.running.clone();
        running.store(true, Ordering::Release);
        let path = self.path.clone();

        let worker = thread::Builder::new()
            .name(format!("v4l2-capture-{}", handler.channel()))
            .spawn(move || {
                let card = handler.channel();
                let mut stream =
                    match MmapStream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS) {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(card, path = %path, "Failed to start streaming: {e}");
                            handler.disconnected();
                            return;
                        }
                    };
                stream.set_timeout(DEQUEUE_TIMEOUT);
                info!(card, path = %path, "Streaming with {} buffers", STREAM_BUFFERS);

                while running.load(Ordering::Acquire) {
                    let (buf, meta) = match stream.next() {
                        Ok(next) => next,
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                        Err(e) => {
                            warn!(card, "Dequeue failed: {e}");
                            handler.disconnected();
                            break;
                        }
                    };
                    let timecode = meta.sequence as u16;
                    let arrival = match pool.as_ref().and_then(FrameBufferPool::try_alloc) {
                        Some(mut pooled) => {
                            let used = meta.bytesused as usize;
                            pooled.fill_from(&buf[..used.min(buf.len())]);
                            FrameArrival {
                                timecode,
                                video: Frame::new(pooled, Instant::now()),
                                audio: None,
                                format,
                            }
                        }
                        None => FrameArrival::empty(timecode, format),
                    };
                    handler.on_frame(arrival);
                }
                debug!(card, "V4L2 capture stopped");
            })
            .map_err(CaptureError::Io)?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(path = %self.path, "V4L2 capture thread panicked");
            }
        }
    }

    fn nominal_format(&self) -> VideoFormat {
        self.requested
    }
}

impl Drop for V4l2Capture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v210_has_no_v4l2_mapping() {
        assert!(fourcc(PixelFormat::V210).is_none());
        assert_eq!(fourcc(PixelFormat::Uyvy422), Some(FourCC::new(b"UYVY")));
    }

    #[test]
    fn missing_device_is_reported() {
        let mut capture = V4l2Capture::new("/dev/does-not-exist", VideoFormat::default());
        assert!(matches!(capture.start(), Err(CaptureError::DeviceNotFound(_))));
    }
}
