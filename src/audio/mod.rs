pub mod convert;
pub mod mixer;
pub mod resampling_queue;
pub mod ring_sink;
pub mod task_queue;

pub use mixer::AudioMixer;
pub use resampling_queue::RateAdjustmentPolicy;
pub use ring_sink::{audio_ring, AudioRingReader, AudioRingSink};
pub use task_queue::{AudioSink, AudioTask, AudioTaskQueue};
