//! Fixed-size capture buffer pool
//!
//! Drivers copy (or DMA) raw card data into pooled slots instead of allocating
//! per frame. A slot returns to the free list when its [`PooledBuffer`] is
//! dropped, which for shared frames means when the last reference goes away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use crossbeam::utils::CachePadded;
use tracing::{info, warn};

/// Pool of reusable capture buffers, cheap to clone
#[derive(Clone)]
pub struct FrameBufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<(usize, BytesMut)>>,
    buffer_size: usize,
    buffer_count: usize,
    stats: CachePadded<PoolStats>,
}

#[derive(Default)]
struct PoolStats {
    allocations: AtomicUsize,
    exhausted: AtomicUsize,
}

impl FrameBufferPool {
    pub fn new(buffer_count: usize, buffer_size: usize) -> Self {
        info!(
            buffer_count,
            buffer_size_mb = buffer_size as f64 / (1024.0 * 1024.0),
            "Creating frame buffer pool"
        );

        let free = (0..buffer_count)
            .map(|slot| (slot, BytesMut::with_capacity(buffer_size)))
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                buffer_size,
                buffer_count,
                stats: CachePadded::new(PoolStats::default()),
            }),
        }
    }

    /// Take a free buffer, or `None` if every slot is in use.
    pub fn try_alloc(&self) -> Option<PooledBuffer> {
        let entry = self.inner.free_list().pop();
        match entry {
            Some((slot, mut data)) => {
                data.clear();
                self.inner.stats.allocations.fetch_add(1, Ordering::Relaxed);
                Some(PooledBuffer {
                    slot,
                    data: Some(data),
                    pool: self.inner.clone(),
                })
            }
            None => {
                let exhausted = self.inner.stats.exhausted.fetch_add(1, Ordering::Relaxed) + 1;
                if exhausted.is_power_of_two() {
                    warn!(exhausted, "Frame buffer pool exhausted");
                }
                None
            }
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn size(&self) -> usize {
        self.inner.buffer_count
    }

    pub fn available(&self) -> usize {
        self.inner.free_list().len()
    }

    /// Slot ids currently sitting on the free list.
    pub fn free_slots(&self) -> Vec<usize> {
        self.inner.free_list().iter().map(|(slot, _)| *slot).collect()
    }

    /// Number of failed allocations so far.
    pub fn exhausted_count(&self) -> usize {
        self.inner.stats.exhausted.load(Ordering::Relaxed)
    }
}

impl PoolInner {
    fn free_list(&self) -> MutexGuard<'_, Vec<(usize, BytesMut)>> {
        // A panic while holding this lock cannot leave the list inconsistent.
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One loaned pool slot; returns itself to the pool on drop
pub struct PooledBuffer {
    slot: usize,
    data: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.pool.buffer_size
    }

    /// Replace the contents, truncating to the slot capacity.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.pool.buffer_size);
        if let Some(data) = self.data.as_mut() {
            data.clear();
            data.extend_from_slice(&src[..n]);
        }
        n
    }

    /// Resize to `len` bytes (capped at capacity) with every byte set to `value`.
    pub fn fill_with(&mut self, value: u8, len: usize) {
        let n = len.min(self.pool.buffer_size);
        if let Some(data) = self.data.as_mut() {
            data.clear();
            data.resize(n, value);
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.free_list().push((self.slot, data));
        }
    }
}
