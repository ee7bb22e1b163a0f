//! A scriptable mock `DeviceApi`, used by this crate's own unit tests and exposed to external
//! integration tests under the `test-support` feature -- the same "fixture behind a feature
//! flag" pattern `vulkano` uses internally for its `gfx_dev_and_queue!` test macro, generalized
//! here so it's reachable from `tests/`.

use crate::device::{DeviceApi, FenceHandle, QueueIndex, SubmitInfo};
use crate::error::{Error, OomError, PresentResult};
use crate::present::PresentInfo;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockFenceState {
    signaled: bool,
}

struct Inner {
    fences: Mutex<HashMap<u64, MockFenceState>>,
    next_fence_id: AtomicU64,
    submit_calls: Mutex<Vec<(QueueIndex, SubmitInfo, FenceHandle)>>,
    present_calls: Mutex<Vec<PresentInfo>>,
    submit_count: AtomicUsize,
    /// If set, the next call to `submit` returns this error instead of succeeding, then resets.
    next_submit_error: Mutex<Option<Error>>,
    /// If set, every `present` call returns this result.
    present_result: Mutex<PresentResult>,
    signal_cv: Condvar,
    signal_lock: Mutex<()>,
}

/// A device backend entirely driven by the test: fences are signaled explicitly via
/// `signal_fence`, submit failures are injected via `fail_next_submit`.
pub struct MockDevice {
    inner: Inner,
}

impl MockDevice {
    pub fn new() -> Self {
        MockDevice {
            inner: Inner {
                fences: Mutex::new(HashMap::new()),
                next_fence_id: AtomicU64::new(1),
                submit_calls: Mutex::new(Vec::new()),
                present_calls: Mutex::new(Vec::new()),
                submit_count: AtomicUsize::new(0),
                next_submit_error: Mutex::new(None),
                present_result: Mutex::new(PresentResult::Success),
                signal_cv: Condvar::new(),
                signal_lock: Mutex::new(()),
            },
        }
    }

    pub fn signal_fence(&self, fence: FenceHandle) {
        if let Some(state) = self.inner.fences.lock().get_mut(&fence.0) {
            state.signaled = true;
        }
        let _guard = self.inner.signal_lock.lock();
        self.inner.signal_cv.notify_all();
    }

    pub fn fail_next_submit(&self, error: Error) {
        *self.inner.next_submit_error.lock() = Some(error);
    }

    pub fn set_present_result(&self, result: PresentResult) {
        *self.inner.present_result.lock() = result;
    }

    pub fn submit_order(&self) -> Vec<FenceHandle> {
        self.inner
            .submit_calls
            .lock()
            .iter()
            .map(|(_, _, fence)| *fence)
            .collect()
    }

    pub fn submit_count(&self) -> usize {
        self.inner.submit_count.load(Ordering::SeqCst)
    }

    pub fn present_count(&self) -> usize {
        self.inner.present_calls.lock().len()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceApi for MockDevice {
    fn submit(&self, queue: QueueIndex, info: &SubmitInfo, fence: FenceHandle) -> Result<(), Error> {
        if let Some(err) = self.inner.next_submit_error.lock().take() {
            return Err(err);
        }
        self.inner.submit_count.fetch_add(1, Ordering::SeqCst);
        self.inner
            .submit_calls
            .lock()
            .push((queue, info.clone(), fence));
        Ok(())
    }

    fn present(&self, _queue: QueueIndex, info: &PresentInfo) -> Result<PresentResult, Error> {
        self.inner.present_calls.lock().push(info.clone());
        Ok(*self.inner.present_result.lock())
    }

    fn create_fence(&self) -> Result<FenceHandle, OomError> {
        let id = self.inner.next_fence_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .fences
            .lock()
            .insert(id, MockFenceState::default());
        Ok(FenceHandle(id))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.inner.fences.lock().remove(&fence.0);
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), Error> {
        if let Some(state) = self.inner.fences.lock().get_mut(&fence.0) {
            state.signaled = false;
        }
        Ok(())
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<bool, Error> {
        Ok(self
            .inner
            .fences
            .lock()
            .get(&fence.0)
            .map(|s| s.signaled)
            .unwrap_or(false))
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.fence_status(fence)? {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let mut guard = self.inner.signal_lock.lock();
            let wait_for = remaining.min(Duration::from_millis(5));
            self.inner.signal_cv.wait_for(&mut guard, wait_for);
        }
    }

    fn queue_wait_idle(&self, _queue: QueueIndex) -> Result<(), Error> {
        Ok(())
    }

    fn export_fence_fd(&self, _fence: FenceHandle) -> Result<i32, Error> {
        Ok(-1)
    }
}
