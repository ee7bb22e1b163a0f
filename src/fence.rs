//! Fence lifetime management: a free-list recycler plus a shared-ownership handle that returns
//! itself to the recycler on last release (§4.1, §9 "Shared mutable fences across threads").

use crate::device::{DeviceApi, FenceHandle};
use crate::error::{Error, OomError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct FenceRecyclerInner {
    free: Mutex<Vec<FenceHandle>>,
}

/// A guarded free-list of fence handles, cheap to clone (it's a thin `Arc` wrapper) so every
/// `SharedFence` can hold one without borrowing from `CommandQueue`.
#[derive(Clone)]
pub struct FenceRecycler {
    inner: Arc<FenceRecyclerInner>,
}

impl FenceRecycler {
    pub fn new() -> Self {
        FenceRecycler {
            inner: Arc::new(FenceRecyclerInner {
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Pops and resets a fence from the free list, or creates a new one if empty. Fence creation
    /// is expensive on real drivers; this is the whole point of the recycler.
    pub fn fetch(&self, device: &dyn DeviceApi) -> Result<FenceHandle, OomError> {
        if let Some(fence) = self.inner.free.lock().pop() {
            Ok(fence)
        } else {
            device.create_fence()
        }
    }

    /// Returns an unsignaled fence to the free list. The caller must have already observed it
    /// signaled and reset it (or it must never have been submitted).
    fn recycle(&self, device: &dyn DeviceApi, fence: FenceHandle) {
        if device.reset_fence(fence).is_ok() {
            self.inner.free.lock().push(fence);
        } else {
            device.destroy_fence(fence);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl Default for FenceRecycler {
    fn default() -> Self {
        Self::new()
    }
}

struct SharedFenceInner {
    device: Arc<dyn DeviceApi>,
    handle: FenceHandle,
    recycler: Mutex<Option<FenceRecycler>>,
}

impl Drop for SharedFenceInner {
    fn drop(&mut self) {
        match self.recycler.lock().take() {
            Some(recycler) => recycler.recycle(self.device.as_ref(), self.handle),
            None => self.device.destroy_fence(self.handle),
        }
    }
}

/// A shared-ownership fence handle. May be polled by the completion thread, waited on by a user
/// thread, and returned to the recycler by whichever of those is holding the last clone when it
/// drops -- `Arc`'s refcounting gives us that "last releaser" semantics for free.
#[derive(Clone)]
pub struct SharedFence(Arc<SharedFenceInner>);

impl SharedFence {
    /// Fetches a fence from `recycler` (or creates one) and wraps it, attached to that recycler.
    pub fn fetch(device: Arc<dyn DeviceApi>, recycler: &FenceRecycler) -> Result<Self, OomError> {
        let handle = recycler.fetch(device.as_ref())?;
        Ok(SharedFence(Arc::new(SharedFenceInner {
            device,
            handle,
            recycler: Mutex::new(Some(recycler.clone())),
        })))
    }

    /// Wraps a caller-supplied (external) fence. Not attached to any recycler: on last release it
    /// is destroyed directly, never recycled, since it was never allocated from this recycler's
    /// pool.
    pub fn from_external(device: Arc<dyn DeviceApi>, handle: FenceHandle) -> Self {
        SharedFence(Arc::new(SharedFenceInner {
            device,
            handle,
            recycler: Mutex::new(None),
        }))
    }

    #[inline]
    pub fn handle(&self) -> FenceHandle {
        self.0.handle
    }

    /// Detaches this fence from its recycler so a subsequent drop destroys it directly instead of
    /// returning it to a free list. Used on the device-lost path, where a batch is torn down
    /// outside the normal release flow and the recycler (or the queue it belongs to) may not be
    /// trusted for further reuse.
    pub fn detach(&self) {
        self.0.recycler.lock().take();
    }

    pub fn status(&self) -> Result<bool, Error> {
        self.0.device.fence_status(self.0.handle)
    }

    pub fn wait(&self, timeout: Duration) -> Result<bool, Error> {
        self.0.device.wait_fence(self.0.handle, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    #[test]
    fn fetch_then_recycle_round_trips_size() {
        let device: Arc<dyn DeviceApi> = Arc::new(MockDevice::new());
        let recycler = FenceRecycler::new();
        assert_eq!(recycler.len(), 0);

        let fence = SharedFence::fetch(device.clone(), &recycler).unwrap();
        assert_eq!(recycler.len(), 0); // nothing free yet, we just fetched

        drop(fence);
        assert_eq!(recycler.len(), 1); // last release returns it

        let fence2 = SharedFence::fetch(device, &recycler).unwrap();
        assert_eq!(recycler.len(), 0);
        drop(fence2);
        assert_eq!(recycler.len(), 1);
    }

    #[test]
    fn external_fence_is_never_recycled() {
        let device: Arc<dyn DeviceApi> = Arc::new(MockDevice::new());
        let recycler = FenceRecycler::new();
        let external = device.create_fence().unwrap();
        let fence = SharedFence::from_external(device, external);
        drop(fence);
        assert_eq!(recycler.len(), 0);
    }

    #[test]
    fn detach_prevents_recycle_on_drop() {
        let device: Arc<dyn DeviceApi> = Arc::new(MockDevice::new());
        let recycler = FenceRecycler::new();
        let fence = SharedFence::fetch(device, &recycler).unwrap();
        fence.detach();
        drop(fence);
        assert_eq!(recycler.len(), 0);
    }

    #[test]
    fn shared_clone_only_recycles_on_last_drop() {
        let device: Arc<dyn DeviceApi> = Arc::new(MockDevice::new());
        let recycler = FenceRecycler::new();
        let fence = SharedFence::fetch(device, &recycler).unwrap();
        let fence2 = fence.clone();
        drop(fence);
        assert_eq!(recycler.len(), 0);
        drop(fence2);
        assert_eq!(recycler.len(), 1);
    }
}
