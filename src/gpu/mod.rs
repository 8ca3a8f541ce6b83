//! GPU-side resource lifetimes
//!
//! The mixer thread owns the GPU context. Everything here is either a
//! refcounted handle that may cross threads, or a job that only ever runs on
//! the mixer thread.

pub mod fence;
pub mod handle;
pub mod in_flight;
pub mod upload;

pub use fence::GpuFence;
pub use handle::{GpuHandle, HandlePool};
pub use in_flight::InFlightFrames;
pub use upload::{NullUploader, UploadJob, Uploader};
