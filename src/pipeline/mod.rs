//! From drained channel frames to published outputs

pub mod mixer;
pub mod output;
pub mod output_device;
pub mod renderer;

pub use mixer::{
    ConfigChangedCallback, FrameSink, Mixer, MixerBuilder, MixerCore, MixerHandle, MixerSettings,
    TickOutcome,
};
pub use output::{ComposedFrame, OutputChannel, OutputId};
pub use output_device::{OutputDevice, OutputSlot, PacedOutput};
pub use renderer::{
    ChannelInput, CutControl, CutRenderer, RenderInput, RenderedOutput, RenderedOutputs, Renderer,
};
