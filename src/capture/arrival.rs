//! Frame-arrival callback, run on the driver's own thread
//!
//! The handler only classifies what arrived and pushes queue entries; every
//! scheduling decision is left to the mixer thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::channel::{CardGroup, QueuedFrame};
use super::driver::FrameArrival;
use super::frame::{Frame, RefCountedFrame, VideoFormat};
use crate::audio::convert::to_stereo_f32;
use crate::audio::AudioMixer;
use crate::gpu::upload::UploadJob;
use crate::{samples_per_duration, MAX_FPS, TIMEBASE};

/// Unwrap a 16-bit hardware timecode against the previous (unwrapped) value.
///
/// A code that is not strictly larger than the last one is taken to have
/// wrapped around.
pub fn unwrap_timecode(current: u16, last: i32) -> i32 {
    let current = i32::from(current);
    let last_wrapped = last & 0xffff;
    if current > last_wrapped {
        (last & !0xffff) | current
    } else {
        0x10000 + ((last & !0xffff) | current)
    }
}

/// Callback state for one capture channel
pub struct ArrivalHandler {
    channel: usize,
    group: Arc<CardGroup>,
    audio: Arc<AudioMixer>,
    last_timecode: Option<u16>,
    last_format: Option<VideoFormat>,
    delay_second_field: bool,
}

impl ArrivalHandler {
    pub fn new(channel: usize, group: Arc<CardGroup>, audio: Arc<AudioMixer>) -> Self {
        Self {
            channel,
            group,
            audio,
            last_timecode: None,
            last_format: None,
            delay_second_field: true,
        }
    }

    /// Enqueue both fields of interlaced frames immediately (offline use, tests).
    pub fn without_field_delay(mut self) -> Self {
        self.delay_second_field = false;
        self
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// The driver lost its device; the mixer will swap in a stand-in source.
    pub fn disconnected(&self) {
        warn!(card = self.channel, "Capture device disconnected");
        self.group.set_disconnected(self.channel, true);
    }

    pub fn on_frame(&mut self, arrival: FrameArrival) {
        let FrameArrival {
            timecode,
            video,
            audio,
            format,
        } = arrival;
        let card = self.channel;
        let counters = self.group.counters(card);
        counters.frames_received.fetch_add(1, Ordering::Relaxed);

        if self.last_format.map(|f| f.has_signal) != Some(format.has_signal) {
            if format.has_signal {
                info!(card, width = format.width, height = format.height, "Signal present");
            } else {
                warn!(card, "No signal");
            }
        }
        self.last_format = Some(format);

        let frame_length = format.frame_length();
        let samples_per_frame = samples_per_duration(frame_length);

        let previous = self.last_timecode.replace(timecode);
        let mut dropped_frames = match previous {
            Some(last) => {
                let last = i32::from(last);
                (unwrap_timecode(timecode, last) - last - 1) as u32
            }
            None => 0,
        };

        if dropped_frames > MAX_FPS * 2 {
            warn!(
                card,
                from = previous.unwrap_or_default(),
                to = timecode,
                dropped_frames,
                "Lost more than two seconds (or timecode jumped), resetting resampler"
            );
            self.audio.reset_resampler(card);
            dropped_frames = 0;
        } else if dropped_frames > 0 {
            self.audio.add_silence(card, samples_per_frame, dropped_frames as usize);
            counters
                .frames_dropped
                .fetch_add(u64::from(dropped_frames), Ordering::Relaxed);
            metrics::counter!("apollo_input_dropped_frames", "card" => card.to_string())
                .increment(u64::from(dropped_frames));
        }

        match &audio {
            Some(block) => self.audio.add_audio(card, &to_stereo_f32(&block.data, block.format)),
            None => self.audio.add_audio(card, &vec![0.0; samples_per_frame * 2]),
        }

        let expected = format.expected_len();
        if video.is_empty() || video.len() != expected {
            if !video.is_empty() {
                warn!(card, len = video.len(), expected, "Dropping video frame with wrong length");
                counters.frames_corrupted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("apollo_input_corrupted_frames", "card" => card.to_string())
                    .increment(1);
            }
            let received = video.received;
            drop(video);

            // Still tell the mixer a frame was due, so pts keeps moving.
            self.group.push(
                card,
                QueuedFrame {
                    frame: RefCountedFrame::new(Frame::marker(received)),
                    format,
                    length: frame_length,
                    field: 0,
                    dropped_frames,
                    upload: None,
                },
            );
            return;
        }

        let frame = RefCountedFrame::new(video);
        if !format.interlaced {
            self.group.push(
                card,
                QueuedFrame {
                    frame,
                    format,
                    length: frame_length,
                    field: 0,
                    dropped_frames,
                    upload: Some(UploadJob::Progressive { format }),
                },
            );
            return;
        }

        let field_length = frame_length / 2;
        for field in 0..2u8 {
            if field == 1 && self.delay_second_field {
                // Keep the second field one field-duration behind the first.
                let field_duration =
                    Duration::from_nanos((field_length * 1_000_000_000 / TIMEBASE) as u64);
                let target = frame.received + field_duration;
                thread::sleep(target.saturating_duration_since(Instant::now()));
            }
            self.group.push(
                card,
                QueuedFrame {
                    frame: frame.clone(),
                    format,
                    length: field_length,
                    field,
                    dropped_frames: if field == 0 { dropped_frames } else { 0 },
                    upload: Some(UploadJob::Field { format, field }),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::convert::AudioFormat;
    use crate::capture::driver::AudioBlock;
    use crate::capture::pool::FrameBufferPool;
    use crate::capture::PixelFormat;
    use bytes::Bytes;

    fn small_format() -> VideoFormat {
        VideoFormat {
            width: 8,
            height: 4,
            frame_rate_nom: 60,
            frame_rate_den: 1,
            interlaced: false,
            has_signal: true,
            pixel_format: PixelFormat::Uyvy422,
        }
    }

    fn audio_block(samples: usize) -> AudioBlock {
        AudioBlock {
            data: Bytes::from(vec![0u8; samples * 8]),
            format: AudioFormat::default(),
        }
    }

    fn setup() -> (Arc<CardGroup>, Arc<AudioMixer>, ArrivalHandler, FrameBufferPool) {
        let group = CardGroup::new(1);
        let audio = Arc::new(AudioMixer::new(1, 0).unwrap());
        let handler = ArrivalHandler::new(0, group.clone(), audio.clone()).without_field_delay();
        (group, audio, handler, FrameBufferPool::new(4, 64))
    }

    fn arrival(pool: &FrameBufferPool, timecode: u16, len: usize, format: VideoFormat) -> FrameArrival {
        let video = if len == 0 {
            Frame::marker(Instant::now())
        } else {
            let mut buf = pool.try_alloc().unwrap();
            buf.fill_with(0x80, len);
            Frame::new(buf, Instant::now())
        };
        FrameArrival {
            timecode,
            video,
            audio: Some(audio_block(800)),
            format,
        }
    }

    #[test]
    fn unwrap_handles_wraparound() {
        assert_eq!(unwrap_timecode(0x0001, 0xfffe), 0x10001);
        assert_eq!(unwrap_timecode(5, 4), 5);
        // Equal codes count as a full wrap.
        assert_eq!(unwrap_timecode(4, 4), 0x10004);
        assert_eq!(unwrap_timecode(2, 0x1_0005), 0x2_0002);
    }

    #[test]
    fn wrapped_timecode_gap_inserts_two_silences_and_one_marker() {
        let (group, audio, mut handler, pool) = setup();
        let format = small_format();

        handler.on_frame(arrival(&pool, 0xfffe, 0, format));
        group.lock()[0].frames.clear();

        handler.on_frame(arrival(&pool, 0x0001, 0, format));
        let queues = group.lock();
        assert_eq!(queues[0].frames.len(), 1);
        let entry = &queues[0].frames[0];
        assert!(entry.is_marker());
        assert_eq!(entry.dropped_frames, 2);
        assert_eq!(entry.length, 2000);
        assert_eq!(audio.stats(0).unwrap().silence_insertions, 2);
        assert_eq!(group.stats()[0].frames_dropped, 2);
    }

    #[test]
    fn huge_gap_resets_resampler_instead_of_backfilling() {
        let (group, audio, mut handler, pool) = setup();
        let format = small_format();
        handler.on_frame(arrival(&pool, 100, 0, format));
        handler.on_frame(arrival(&pool, 100 + 500, 0, format));

        let stats = audio.stats(0).unwrap();
        assert_eq!(stats.silence_insertions, 0);
        assert_eq!(stats.resets, 1);
        assert_eq!(group.lock()[0].frames.back().unwrap().dropped_frames, 0);
    }

    #[test]
    fn wrong_length_becomes_marker_and_releases_buffer() {
        let (group, _audio, mut handler, pool) = setup();
        let format = small_format();
        handler.on_frame(arrival(&pool, 1, 10, format));

        assert_eq!(pool.available(), 4);
        let queues = group.lock();
        let entry = &queues[0].frames[0];
        assert!(entry.is_marker());
        assert!(entry.upload.is_none());
        assert_eq!(entry.length, format.frame_length());
        drop(queues);
        assert_eq!(group.stats()[0].frames_corrupted, 1);
    }

    #[test]
    fn good_progressive_frame_carries_upload_job() {
        let (group, _audio, mut handler, pool) = setup();
        let format = small_format();
        handler.on_frame(arrival(&pool, 1, format.expected_len(), format));

        let queues = group.lock();
        let entry = &queues[0].frames[0];
        assert!(!entry.is_marker());
        assert_eq!(entry.upload, Some(UploadJob::Progressive { format }));
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn interlaced_frames_split_into_two_fields() {
        let (group, _audio, mut handler, pool) = setup();
        let format = VideoFormat {
            interlaced: true,
            frame_rate_nom: 25,
            ..small_format()
        };
        handler.on_frame(arrival(&pool, 7, 0, format));
        group.lock()[0].frames.clear();
        handler.on_frame(arrival(&pool, 9, format.expected_len(), format));

        let queues = group.lock();
        let frames = &queues[0].frames;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].field, 0);
        assert_eq!(frames[1].field, 1);
        assert_eq!(frames[0].length, 2400);
        assert_eq!(frames[1].length, 2400);
        assert_eq!(frames[0].dropped_frames, 1);
        assert_eq!(frames[1].dropped_frames, 0);
        assert!(frames[0].frame.ptr_eq(&frames[1].frame));
        assert_eq!(frames[1].upload, Some(UploadJob::Field { format, field: 1 }));
    }

    #[test]
    fn second_field_is_held_back_one_field_duration() {
        let group = CardGroup::new(1);
        let audio = Arc::new(AudioMixer::new(1, 0).unwrap());
        let mut handler = ArrivalHandler::new(0, group.clone(), audio);
        let pool = FrameBufferPool::new(4, 64);
        // 10 fps interlaced: 50 ms per field.
        let format = VideoFormat {
            interlaced: true,
            frame_rate_nom: 10,
            ..small_format()
        };
        let field_duration = Duration::from_millis(50);

        let frame = arrival(&pool, 1, format.expected_len(), format);
        let received = frame.video.received;
        let worker = thread::spawn(move || handler.on_frame(frame));

        let mut first_seen = None;
        let second_seen = loop {
            let depth = group.lock()[0].frames.len();
            let now = Instant::now();
            if depth == 1 && first_seen.is_none() {
                first_seen = Some(now);
            }
            if depth == 2 {
                break now;
            }
            assert!(now < received + Duration::from_secs(5), "second field never queued");
            thread::sleep(Duration::from_millis(1));
        };
        worker.join().unwrap();

        let first_seen = first_seen.expect("first field queued on its own");
        assert!(first_seen < received + field_duration);
        assert!(second_seen >= received + field_duration);
        let queues = group.lock();
        assert_eq!(queues[0].frames[0].field, 0);
        assert_eq!(queues[0].frames[1].field, 1);
    }

    #[test]
    fn disconnect_sets_flag() {
        let (group, _audio, handler, _pool) = setup();
        handler.disconnected();
        assert!(group.is_disconnected(0));
    }
}
