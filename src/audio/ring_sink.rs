//! Lock-free ring buffer between the audio worker and a playback consumer

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::task_queue::{AudioSink, AudioTask};

/// Producer half; lives inside the audio worker as an [`AudioSink`]
pub struct AudioRingSink {
    producer: HeapProd<f32>,
    stats: Arc<CachePadded<Stats>>,
}

/// Consumer half; owned by whatever plays the audio out
pub struct AudioRingReader {
    consumer: HeapCons<f32>,
    stats: Arc<CachePadded<Stats>>,
}

#[derive(Default)]
struct Stats {
    samples_written: AtomicUsize,
    samples_read: AtomicUsize,
    samples_dropped: AtomicUsize,
    underruns: AtomicUsize,
}

/// SPSC ring holding up to `capacity` interleaved samples.
pub fn audio_ring(capacity: usize) -> (AudioRingSink, AudioRingReader) {
    let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();
    let stats = Arc::new(CachePadded::new(Stats::default()));
    (
        AudioRingSink {
            producer,
            stats: stats.clone(),
        },
        AudioRingReader { consumer, stats },
    )
}

impl AudioSink for AudioRingSink {
    /// Samples that don't fit are dropped; the reader is too slow.
    fn write(&mut self, _task: &AudioTask, samples: &[f32]) {
        let pushed = self.producer.push_slice(samples);
        self.stats.samples_written.fetch_add(pushed, Ordering::Relaxed);
        if pushed < samples.len() {
            self.stats
                .samples_dropped
                .fetch_add(samples.len() - pushed, Ordering::Relaxed);
        }
    }
}

impl AudioRingReader {
    /// Fill `out` completely, padding with silence if the ring runs dry.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let n = self.consumer.pop_slice(out);
        self.stats.samples_read.fetch_add(n, Ordering::Relaxed);
        if n < out.len() {
            out[n..].fill(0.0);
            self.stats.underruns.fetch_add(1, Ordering::Relaxed);
        }
        n
    }

    pub fn len(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (written, read, dropped, underruns)
    pub fn stats(&self) -> (usize, usize, usize, usize) {
        (
            self.stats.samples_written.load(Ordering::Relaxed),
            self.stats.samples_read.load(Ordering::Relaxed),
            self.stats.samples_dropped.load(Ordering::Relaxed),
            self.stats.underruns.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(pts: i64) -> AudioTask {
        AudioTask {
            pts,
            num_samples: 0,
            adjust_rate: true,
        }
    }

    #[test]
    fn overflow_drops_newest_samples() {
        let (mut sink, reader) = audio_ring(4);
        sink.write(&task(0), &[1.0, 2.0, 3.0]);
        sink.write(&task(1), &[4.0, 5.0, 6.0]);
        assert_eq!(reader.len(), 4);
        assert_eq!(reader.stats(), (4, 0, 2, 0));
    }

    #[test]
    fn underrun_pads_with_silence() {
        let (mut sink, mut reader) = audio_ring(8);
        sink.write(&task(0), &[0.5, 0.5]);
        let mut out = [1.0f32; 4];
        assert_eq!(reader.read(&mut out), 2);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0]);
        assert_eq!(reader.stats().3, 1);
        assert!(reader.is_empty());
    }
}
