use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::pool::PooledBuffer;
use crate::TIMEBASE;

/// Pixel formats the capture cards deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit 4:2:2 Y'CbCr, packed as UYVY
    Uyvy422,
    /// 10-bit 4:2:2 Y'CbCr, v210 packing
    V210,
    Bgra,
    Nv12,
}

impl PixelFormat {
    /// Bytes in one row of `width` pixels.
    pub fn stride(self, width: u32) -> usize {
        let width = width as usize;
        match self {
            PixelFormat::Uyvy422 => width * 2,
            // 48 pixels per 128-byte block
            PixelFormat::V210 => width.div_ceil(48) * 128,
            PixelFormat::Bgra => width * 4,
            PixelFormat::Nv12 => width,
        }
    }

    /// Exact payload size of one progressive frame.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let rows = height as usize;
        match self {
            PixelFormat::Nv12 => self.stride(width) * rows * 3 / 2,
            _ => self.stride(width) * rows,
        }
    }
}

/// Signal format as reported by the driver with every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate_nom: u32,
    pub frame_rate_den: u32,
    pub interlaced: bool,
    pub has_signal: bool,
    pub pixel_format: PixelFormat,
}

impl VideoFormat {
    /// Duration of one hardware frame in `TIMEBASE` units.
    pub fn frame_length(&self) -> i64 {
        if self.frame_rate_nom == 0 {
            return TIMEBASE / 60;
        }
        TIMEBASE * i64::from(self.frame_rate_den) / i64::from(self.frame_rate_nom)
    }

    pub fn expected_len(&self) -> usize {
        self.pixel_format.frame_len(self.width, self.height)
    }

    /// When frame `index` of a stream that started at `start` is due.
    pub fn frame_deadline(&self, start: Instant, index: u64) -> Instant {
        let nanos = u128::from(index) * self.frame_length() as u128 * 1_000_000_000
            / TIMEBASE as u128;
        start + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate_nom: 60,
            frame_rate_den: 1,
            interlaced: false,
            has_signal: true,
            pixel_format: PixelFormat::Uyvy422,
        }
    }
}

/// Raw capture buffer plus the metadata needed to release it.
///
/// A frame without a buffer (or with zero length) is a marker: it carries no
/// pixels and only exists so presentation time keeps moving.
pub struct Frame {
    buf: Option<PooledBuffer>,
    /// Local monotonic arrival time
    pub received: Instant,
}

impl Frame {
    pub fn new(buf: PooledBuffer, received: Instant) -> Self {
        Self {
            buf: Some(buf),
            received,
        }
    }

    pub fn marker(received: Instant) -> Self {
        Self {
            buf: None,
            received,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Pool slot backing this frame, if any.
    pub fn slot(&self) -> Option<usize> {
        self.buf.as_ref().map(PooledBuffer::slot)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len())
            .field("slot", &self.slot())
            .finish()
    }
}

/// A frame shared between queues and in-flight renders.
///
/// The buffer goes back to its pool when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct RefCountedFrame(Arc<Frame>);

impl RefCountedFrame {
    pub fn new(frame: Frame) -> Self {
        Self(Arc::new(frame))
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &RefCountedFrame) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A handle that identifies this frame without keeping its buffer
    /// out of the pool.
    pub fn downgrade(&self) -> WeakFrame {
        WeakFrame(Arc::downgrade(&self.0))
    }
}

/// Identity of a [`RefCountedFrame`] that does not hold on to its pixels.
#[derive(Debug, Clone)]
pub struct WeakFrame(Weak<Frame>);

impl WeakFrame {
    pub fn is(&self, frame: &RefCountedFrame) -> bool {
        Weak::ptr_eq(&self.0, &Arc::downgrade(&frame.0))
    }
}

impl Deref for RefCountedFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v210_rows_are_padded_to_blocks() {
        assert_eq!(PixelFormat::V210.stride(1920), 5120);
        assert_eq!(PixelFormat::V210.stride(1280), 27 * 128);
    }

    #[test]
    fn frame_deadlines_stay_exact_past_u32_frames() {
        let format = VideoFormat::default();
        let start = Instant::now();
        assert_eq!(format.frame_deadline(start, 60) - start, Duration::from_secs(1));

        let far = 1u64 << 32;
        let late = format.frame_deadline(start, far);
        assert!(late - start > Duration::from_secs(365 * 24 * 3600));
        assert_eq!(format.frame_deadline(start, far + 60) - late, Duration::from_secs(1));
    }

    #[test]
    fn frame_length_for_fractional_rates() {
        let format = VideoFormat {
            frame_rate_nom: 60000,
            frame_rate_den: 1001,
            ..Default::default()
        };
        assert_eq!(format.frame_length(), 2002);

        let format = VideoFormat {
            frame_rate_nom: 50,
            ..Default::default()
        };
        assert_eq!(format.frame_length(), 2400);
    }

    #[test]
    fn marker_frames_are_empty() {
        let frame = Frame::marker(Instant::now());
        assert!(frame.is_empty());
        assert_eq!(frame.data(), &[] as &[u8]);
        assert_eq!(frame.slot(), None);
    }
}
