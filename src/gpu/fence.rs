use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// "The GPU is done reading these inputs."
///
/// Clones share one underlying fence; any clone may signal or wait.
#[derive(Clone)]
pub struct GpuFence {
    inner: Arc<FenceInner>,
}

struct FenceInner {
    satisfied: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl GpuFence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                satisfied: AtomicBool::new(false),
                lock: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    /// A fence that is already satisfied, for CPU-only renderers.
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn signal(&self) {
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.satisfied.store(true, Ordering::Release);
        self.inner.cv.notify_all();
    }

    pub fn is_satisfied(&self) -> bool {
        self.inner.satisfied.load(Ordering::Acquire)
    }

    /// Block until satisfied or `timeout` passes. Returns whether it was satisfied.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_satisfied() {
            return true;
        }
        let guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _) = self
            .inner
            .cv
            .wait_timeout_while(guard, timeout, |_| !self.is_satisfied())
            .unwrap_or_else(|e| e.into_inner());
        self.is_satisfied()
    }

    pub fn ptr_eq(&self, other: &GpuFence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for GpuFence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GpuFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuFence")
            .field("satisfied", &self.is_satisfied())
            .finish()
    }
}
