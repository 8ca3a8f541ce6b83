//! Refcounted opaque GPU handles (textures, sync objects)
//!
//! A raw id never leaves this module on its own: it is always wrapped in a
//! [`GpuHandle`], and the last clone hands the id back to its pool.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

#[derive(Clone)]
pub struct HandlePool {
    inner: Arc<HandlePoolInner>,
}

struct HandlePoolInner {
    label: &'static str,
    state: Mutex<HandlePoolState>,
}

#[derive(Default)]
struct HandlePoolState {
    free: Vec<u32>,
    next_id: u32,
    outstanding: usize,
}

impl HandlePool {
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Arc::new(HandlePoolInner {
                label,
                state: Mutex::new(HandlePoolState::default()),
            }),
        }
    }

    /// Hand out a recycled id if one is free, a fresh one otherwise.
    pub fn alloc(&self) -> GpuHandle {
        let mut state = self.inner.state();
        let id = match state.free.pop() {
            Some(id) => id,
            None => {
                state.next_id += 1;
                debug!(pool = self.inner.label, id = state.next_id, "Allocating new GPU handle");
                state.next_id
            }
        };
        state.outstanding += 1;
        GpuHandle {
            inner: Arc::new(HandleInner {
                id,
                pool: self.inner.clone(),
            }),
        }
    }

    /// Handles currently held by someone.
    pub fn outstanding(&self) -> usize {
        self.inner.state().outstanding
    }

    pub fn free_count(&self) -> usize {
        self.inner.state().free.len()
    }
}

impl HandlePoolInner {
    fn state(&self) -> MutexGuard<'_, HandlePoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared ownership of one pooled id
#[derive(Clone)]
pub struct GpuHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: u32,
    pool: Arc<HandlePoolInner>,
}

impl GpuHandle {
    pub fn id(&self) -> u32 {
        self.inner.id
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let mut state = self.pool.state();
        state.free.push(self.id);
        state.outstanding -= 1;
    }
}

impl std::fmt::Debug for GpuHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GpuHandle({}:{})", self.inner.pool.label, self.inner.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_clone_returns_id() {
        let pool = HandlePool::new("texture");
        let a = pool.alloc();
        let b = a.clone();
        assert_eq!(pool.outstanding(), 1);
        drop(a);
        assert_eq!(pool.outstanding(), 1);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn ids_are_recycled() {
        let pool = HandlePool::new("texture");
        let first = pool.alloc().id();
        let again = pool.alloc();
        assert_eq!(again.id(), first);
        let other = pool.alloc();
        assert_ne!(other.id(), again.id());
    }
}
