//! Deferred texture uploads
//!
//! Driver threads cannot touch the GPU context, so each queued frame carries
//! an [`UploadJob`] describing what to upload; the mixer thread runs it.

use crate::capture::frame::{RefCountedFrame, VideoFormat};
use crate::error::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadJob {
    Progressive { format: VideoFormat },
    /// One field of an interlaced frame; the frame is shared by both fields.
    Field { format: VideoFormat, field: u8 },
}

impl UploadJob {
    pub fn format(&self) -> &VideoFormat {
        match self {
            UploadJob::Progressive { format } | UploadJob::Field { format, .. } => format,
        }
    }
}

/// Runs upload jobs inside the GPU context; only called on the mixer thread
pub trait Uploader: Send {
    fn upload(
        &mut self,
        channel: usize,
        frame: &RefCountedFrame,
        job: &UploadJob,
    ) -> Result<(), UploadError>;
}

/// Uploader for CPU-only compositing: nothing to upload.
#[derive(Debug, Default)]
pub struct NullUploader {
    pub uploads: u64,
}

impl Uploader for NullUploader {
    fn upload(
        &mut self,
        _channel: usize,
        _frame: &RefCountedFrame,
        _job: &UploadJob,
    ) -> Result<(), UploadError> {
        self.uploads += 1;
        Ok(())
    }
}
