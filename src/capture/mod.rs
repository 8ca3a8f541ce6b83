pub mod arrival;
pub mod channel;
pub mod driver;
pub mod fake;
pub mod frame;
pub mod pool;
pub mod queue_policy;
#[cfg(feature = "v4l2-capture")]
pub mod v4l2;

pub use arrival::ArrivalHandler;
pub use channel::{CardGroup, ChannelStats, QueuedFrame};
pub use driver::{AudioBlock, CaptureDriver, FrameArrival};
pub use fake::FakeCapture;
pub use frame::{Frame, PixelFormat, RefCountedFrame, VideoFormat, WeakFrame};
pub use pool::{FrameBufferPool, PooledBuffer};
pub use queue_policy::{QueueLengthPolicy, QueueObservation};
#[cfg(feature = "v4l2-capture")]
pub use v4l2::V4l2Capture;
