//! Renderer seam and a minimal cut compositor
//!
//! The real effect graph lives outside this crate. The mixer only needs
//! textures per output, one fence covering the whole render, and the list of
//! input frames the GPU may still be reading.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::output::OutputId;
use crate::capture::frame::{RefCountedFrame, VideoFormat, WeakFrame};
use crate::error::RenderError;
use crate::gpu::{GpuFence, GpuHandle, HandlePool};

/// Latest usable frame of one channel
#[derive(Debug, Clone)]
pub struct ChannelInput {
    pub frame: RefCountedFrame,
    pub format: VideoFormat,
    pub field: u8,
}

/// Everything one render call sees
#[derive(Debug)]
pub struct RenderInput<'a> {
    pub pts: i64,
    pub duration: i64,
    /// Indexed by channel; `None` until a channel delivered its first frame
    pub channels: &'a [Option<ChannelInput>],
}

#[derive(Debug)]
pub struct RenderedOutput {
    pub id: OutputId,
    pub texture: GpuHandle,
    pub width: u32,
    pub height: u32,
    pub pixels: Option<Bytes>,
}

#[derive(Debug)]
pub struct RenderedOutputs {
    pub outputs: Vec<RenderedOutput>,
    pub fence: GpuFence,
    /// Input frames the render read; kept alive until `fence` is satisfied
    pub input_frames: Vec<RefCountedFrame>,
}

/// Called on the mixer thread, once per rendered tick.
pub trait Renderer: Send {
    fn render(&mut self, input: &RenderInput<'_>) -> Result<RenderedOutputs, RenderError>;
}

/// Which channel each output shows; shared with whoever issues cuts.
#[derive(Debug, Default)]
pub struct CutControl {
    live: AtomicUsize,
    preview: AtomicUsize,
}

impl CutControl {
    pub fn new(live: usize, preview: usize) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicUsize::new(live),
            preview: AtomicUsize::new(preview),
        })
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn preview(&self) -> usize {
        self.preview.load(Ordering::Relaxed)
    }

    pub fn set_preview(&self, channel: usize) {
        self.preview.store(channel, Ordering::Relaxed);
    }

    /// Swap preview and live.
    pub fn cut(&self) {
        let preview = self.preview();
        let live = self.live.swap(preview, Ordering::Relaxed);
        self.preview.store(live, Ordering::Relaxed);
    }
}

/// Passes one channel's picture straight through to each output.
///
/// Live and preview follow [`CutControl`]; auxiliary output `n` always shows
/// channel `n` (modulo the channel count). Runs on the CPU, so its fence is
/// signaled before `render` returns.
pub struct CutRenderer {
    control: Arc<CutControl>,
    num_aux_outputs: usize,
    fallback: VideoFormat,
    textures: HandlePool,
    /// Per channel: the frame last copied out and its pixels
    pictures: Vec<Option<(WeakFrame, Bytes)>>,
}

impl CutRenderer {
    pub fn new(control: Arc<CutControl>, num_aux_outputs: usize, fallback: VideoFormat) -> Self {
        Self {
            control,
            num_aux_outputs,
            fallback,
            textures: HandlePool::new("cut-renderer"),
            pictures: Vec::new(),
        }
    }

    pub fn textures(&self) -> &HandlePool {
        &self.textures
    }

    /// Pixels of `input`, copied once per frame however many outputs show it.
    fn picture(&mut self, channel: usize, input: &ChannelInput) -> Bytes {
        if self.pictures.len() <= channel {
            self.pictures.resize(channel + 1, None);
        }
        match &self.pictures[channel] {
            Some((frame, pixels)) if frame.is(&input.frame) => pixels.clone(),
            _ => {
                let pixels = Bytes::copy_from_slice(input.frame.data());
                self.pictures[channel] = Some((input.frame.downgrade(), pixels.clone()));
                pixels
            }
        }
    }

    fn compose(
        &mut self,
        id: OutputId,
        source: usize,
        channels: &[Option<ChannelInput>],
        used: &mut Vec<RefCountedFrame>,
    ) -> RenderedOutput {
        let input = channels.get(source).and_then(Option::as_ref);
        let (width, height, pixels) = match input {
            Some(input) => {
                if !used.iter().any(|f| f.ptr_eq(&input.frame)) {
                    used.push(input.frame.clone());
                }
                (
                    input.format.width,
                    input.format.height,
                    Some(self.picture(source, input)),
                )
            }
            None => (self.fallback.width, self.fallback.height, None),
        };
        RenderedOutput {
            id,
            texture: self.textures.alloc(),
            width,
            height,
            pixels,
        }
    }
}

impl Renderer for CutRenderer {
    fn render(&mut self, input: &RenderInput<'_>) -> Result<RenderedOutputs, RenderError> {
        if input.channels.is_empty() {
            return Err(RenderError::NoInput);
        }
        let num_channels = input.channels.len();
        let mut used = Vec::new();
        let mut outputs = Vec::with_capacity(2 + self.num_aux_outputs);

        outputs.push(self.compose(OutputId::Live, self.control.live(), input.channels, &mut used));
        outputs.push(self.compose(
            OutputId::Preview,
            self.control.preview(),
            input.channels,
            &mut used,
        ));
        for n in 0..self.num_aux_outputs {
            outputs.push(self.compose(OutputId::Aux(n), n % num_channels, input.channels, &mut used));
        }

        Ok(RenderedOutputs {
            outputs,
            fence: GpuFence::signaled(),
            input_frames: used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Frame;
    use crate::capture::pool::FrameBufferPool;
    use std::time::Instant;

    fn input(pool: &FrameBufferPool, luma: u8) -> ChannelInput {
        let format = VideoFormat {
            width: 4,
            height: 2,
            ..Default::default()
        };
        let mut buf = pool.try_alloc().unwrap();
        buf.fill_with(luma, format.expected_len());
        ChannelInput {
            frame: RefCountedFrame::new(Frame::new(buf, Instant::now())),
            format,
            field: 0,
        }
    }

    #[test]
    fn follows_cut_control() {
        let pool = FrameBufferPool::new(2, 16);
        let channels = vec![Some(input(&pool, 1)), Some(input(&pool, 2))];
        let control = CutControl::new(0, 1);
        let mut renderer = CutRenderer::new(control.clone(), 0, VideoFormat::default());

        let render = |r: &mut CutRenderer| {
            r.render(&RenderInput {
                pts: 0,
                duration: 2000,
                channels: &channels,
            })
            .unwrap()
        };

        let out = render(&mut renderer);
        assert_eq!(out.outputs[0].pixels.as_ref().unwrap()[0], 1);
        assert_eq!(out.outputs[1].pixels.as_ref().unwrap()[0], 2);
        assert_eq!(out.input_frames.len(), 2);
        assert!(out.fence.is_satisfied());

        control.cut();
        let out = render(&mut renderer);
        assert_eq!(out.outputs[0].pixels.as_ref().unwrap()[0], 2);
        assert_eq!(out.outputs[1].pixels.as_ref().unwrap()[0], 1);
    }

    #[test]
    fn each_frame_is_copied_once() {
        let pool = FrameBufferPool::new(2, 16);
        let channels = vec![Some(input(&pool, 1)), Some(input(&pool, 2))];
        let mut renderer = CutRenderer::new(CutControl::new(0, 1), 2, VideoFormat::default());
        let render = |r: &mut CutRenderer| {
            r.render(&RenderInput {
                pts: 0,
                duration: 2000,
                channels: &channels,
            })
            .unwrap()
        };
        let pixels = |out: &RenderedOutputs, i: usize| out.outputs[i].pixels.clone().unwrap();

        let first = render(&mut renderer);
        // Live and Aux(0) both show channel 0.
        assert_eq!(first.outputs[2].id, OutputId::Aux(0));
        assert_eq!(pixels(&first, 0).as_ptr(), pixels(&first, 2).as_ptr());
        assert_eq!(pixels(&first, 1).as_ptr(), pixels(&first, 3).as_ptr());

        // The same frames on the next tick reuse the copy.
        let second = render(&mut renderer);
        assert_eq!(pixels(&first, 0).as_ptr(), pixels(&second, 0).as_ptr());
        // The cache does not keep the frames alive.
        drop((first, second));
        assert_eq!(channels[0].as_ref().unwrap().frame.ref_count(), 1);
    }

    #[test]
    fn missing_channels_render_fallback_geometry() {
        let channels: Vec<Option<ChannelInput>> = vec![None];
        let mut renderer = CutRenderer::new(CutControl::new(0, 0), 2, VideoFormat::default());
        let out = renderer
            .render(&RenderInput {
                pts: 0,
                duration: 2000,
                channels: &channels,
            })
            .unwrap();
        assert_eq!(out.outputs.len(), 4);
        assert_eq!(out.outputs[3].id, OutputId::Aux(1));
        assert_eq!((out.outputs[0].width, out.outputs[0].height), (1280, 720));
        assert!(out.input_frames.is_empty());
        drop(out);
        assert_eq!(renderer.textures().outstanding(), 0);
    }

    #[test]
    fn no_channels_is_an_error() {
        let mut renderer = CutRenderer::new(CutControl::new(0, 0), 0, VideoFormat::default());
        let result = renderer.render(&RenderInput {
            pts: 0,
            duration: 2000,
            channels: &[],
        });
        assert!(matches!(result, Err(RenderError::NoInput)));
    }
}
