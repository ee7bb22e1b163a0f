//! `CommandBatch`: one submission's bookkeeping (§3, §4.2 "back-pointer").

use crate::command_pool::CommandPoolAccess;
use crate::device::{CommandBufferHandle, ProtectionType};
use crate::fence::SharedFence;
use crate::serial::QueueSerial;
use smallvec::SmallVec;
use std::sync::{Arc, Weak};

/// At most one of: an internal fence fetched from the recycler, an external fence supplied by
/// the caller, or neither (§3, invariant 5: at most one fence source).
#[derive(Clone)]
pub enum FenceSource {
    Internal(SharedFence),
    External(SharedFence),
    None,
}

impl FenceSource {
    pub fn shared(&self) -> Option<&SharedFence> {
        match self {
            FenceSource::Internal(f) | FenceSource::External(f) => Some(f),
            FenceSource::None => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, FenceSource::External(_))
    }
}

/// A single submission's bookkeeping: its serial, protection mode, the primary buffer it owns
/// (until released), the secondary buffers to recycle alongside it, and its fence source.
///
/// The back-pointer to `CommandPoolAccess` is a `Weak` reference: the batch does not keep the
/// broker alive. Shutdown order (drain queue, then destroy broker) guarantees the broker outlives
/// every batch it issued, so `upgrade()` only fails if that contract is violated -- treated as a
/// logic error (logged, not recycled) rather than a panic, since a batch must never leak a
/// primary buffer silently without at least surfacing the failure to the logs.
pub struct CommandBatch {
    pub queue_serial: QueueSerial,
    pub protection_type: ProtectionType,
    primary: Option<CommandBufferHandle>,
    pool: Option<Weak<CommandPoolAccess>>,
    secondary: SmallVec<[CommandBufferHandle; 8]>,
    fence: FenceSource,
    released: bool,
}

impl CommandBatch {
    pub fn new(queue_serial: QueueSerial, protection_type: ProtectionType) -> Self {
        CommandBatch {
            queue_serial,
            protection_type,
            primary: None,
            pool: None,
            secondary: SmallVec::new(),
            fence: FenceSource::None,
            released: false,
        }
    }

    pub fn set_primary(&mut self, primary: CommandBufferHandle, pool: &Arc<CommandPoolAccess>) {
        self.primary = Some(primary);
        self.pool = Some(Arc::downgrade(pool));
    }

    pub fn set_secondary(&mut self, secondary: SmallVec<[CommandBufferHandle; 8]>) {
        self.secondary = secondary;
    }

    /// Sets this batch's fence source. Panics if a fence source is already set: an
    /// internal-and-external fence on the same batch is forbidden (§4.3 step 4).
    pub fn set_fence(&mut self, fence: FenceSource) {
        assert!(
            matches!(self.fence, FenceSource::None),
            "a batch may only have one fence source"
        );
        self.fence = fence;
    }

    pub fn fence(&self) -> &FenceSource {
        &self.fence
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Normal release path: returns the primary buffer to its pool and drops the fence (back to
    /// the recycler, via `SharedFence`'s own drop). Idempotent-safe to call at most once; a
    /// second call would double-return the same buffer, which is why `released` is checked.
    pub fn release(&mut self) {
        debug_assert!(!self.released, "a batch must not be released twice");
        self.released = true;
        if let Some(primary) = self.primary.take() {
            if let Some(pool) = self.pool.as_ref().and_then(Weak::upgrade) {
                pool.collect_primary(self.protection_type, primary);
            } else {
                log::warn!(
                    "CommandBatch::release: pool broker already gone for serial {:?}, primary buffer leaked",
                    self.queue_serial
                );
            }
        }
        self.secondary.clear();
        self.fence = FenceSource::None;
    }

    /// Device-lost path: destroys the primary buffer directly instead of returning it to the
    /// pool, and detaches the fence from its recycler before letting it drop so the recycler
    /// (which may itself be torn down) is never touched again.
    pub fn destroy_on_device_lost(&mut self) {
        debug_assert!(!self.released, "a batch must not be released twice");
        self.released = true;
        if let Some(primary) = self.primary.take() {
            if let Some(pool) = self.pool.as_ref().and_then(Weak::upgrade) {
                pool.destroy_primary(primary);
            }
        }
        if let Some(fence) = self.fence.shared() {
            fence.detach();
        }
        self.secondary.clear();
        self.fence = FenceSource::None;
    }
}

impl Drop for CommandBatch {
    fn drop(&mut self) {
        if !self.released && (self.primary.is_some() || !matches!(self.fence, FenceSource::None)) {
            log::warn!(
                "CommandBatch for serial {:?} dropped without release() or destroy_on_device_lost()",
                self.queue_serial
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceApi;
    use crate::fence::FenceRecycler;
    use crate::serial::Serial;
    use crate::testing::MockDevice;

    #[test]
    fn release_returns_primary_exactly_once() {
        let pool = Arc::new(CommandPoolAccess::new());
        let mut batch = CommandBatch::new(QueueSerial::new(0, Serial::from_raw(1)), ProtectionType::Unprotected);
        batch.set_primary(CommandBufferHandle(7), &pool);
        batch.release();
        assert!(!batch.has_primary());
        // collected back into the pool, so a fresh flush reuses handle 7
        pool.flush_outside_render_pass(ProtectionType::Unprotected, crate::device::Priority::Low, CommandBufferHandle(99));
        let flushed = pool.get_commands_and_wait_semaphores(ProtectionType::Unprotected, crate::device::Priority::Low);
        assert_eq!(flushed.primary, Some(CommandBufferHandle(7)));
    }

    #[test]
    fn device_lost_detaches_fence_instead_of_recycling() {
        let device: Arc<dyn DeviceApi> = Arc::new(MockDevice::new());
        let recycler = FenceRecycler::new();
        let fence = SharedFence::fetch(device, &recycler).unwrap();

        let mut batch = CommandBatch::new(QueueSerial::new(0, Serial::from_raw(1)), ProtectionType::Unprotected);
        batch.set_fence(FenceSource::Internal(fence));
        batch.destroy_on_device_lost();
        assert_eq!(recycler.len(), 0);
    }

    #[test]
    #[should_panic]
    fn double_fence_source_panics() {
        let device: Arc<dyn DeviceApi> = Arc::new(MockDevice::new());
        let recycler = FenceRecycler::new();
        let f1 = SharedFence::fetch(device.clone(), &recycler).unwrap();
        let f2 = SharedFence::fetch(device, &recycler).unwrap();

        let mut batch = CommandBatch::new(QueueSerial::new(0, Serial::from_raw(1)), ProtectionType::Unprotected);
        batch.set_fence(FenceSource::Internal(f1));
        batch.set_fence(FenceSource::External(f2));
    }
}
