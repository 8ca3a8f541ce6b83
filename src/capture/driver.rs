//! Contract between hardware drivers and the capture channels

use std::time::Instant;

use bytes::Bytes;

use super::arrival::ArrivalHandler;
use super::frame::{Frame, VideoFormat};
use super::pool::FrameBufferPool;
use crate::audio::convert::AudioFormat;
use crate::error::CaptureError;

/// Raw audio delivered together with a video frame
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub data: Bytes,
    pub format: AudioFormat,
}

impl AudioBlock {
    pub fn num_samples(&self) -> usize {
        self.format.num_samples(self.data.len())
    }
}

/// Everything a driver hands over for one hardware frame
#[derive(Debug)]
pub struct FrameArrival {
    /// 16-bit wrapping hardware frame counter
    pub timecode: u16,
    /// May be a marker (empty) or a wrongly sized, corrupted payload
    pub video: Frame,
    pub audio: Option<AudioBlock>,
    pub format: VideoFormat,
}

impl FrameArrival {
    /// A frame with no payload at all, e.g. when the pool ran dry.
    pub fn empty(timecode: u16, format: VideoFormat) -> Self {
        Self {
            timecode,
            video: Frame::marker(Instant::now()),
            audio: None,
            format,
        }
    }
}

/// A capture source. Drivers own their threads and call the registered
/// [`ArrivalHandler`] from them.
pub trait CaptureDriver: Send {
    fn description(&self) -> String;

    /// Buffers the driver should receive video into.
    fn set_allocator(&mut self, pool: FrameBufferPool);

    fn set_frame_callback(&mut self, handler: ArrivalHandler);

    fn start(&mut self) -> Result<(), CaptureError>;

    /// Stop capturing and join the driver's threads.
    fn stop(&mut self);

    /// Format used when the driver has not delivered a frame yet.
    fn nominal_format(&self) -> VideoFormat;
}
