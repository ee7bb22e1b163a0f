//! The abstract device/queue boundary. The real driver-level GPU API is out of scope (§1); here
//! it is an opaque trait object so the submission core can be exercised against a mock in tests
//! and driven by any concrete backend in production, the way `vulkano`'s own `Queue` sits behind
//! a dispatch-table (`fns()`) rather than calling `vkQueueSubmit` directly from call sites.

use crate::error::{Error, OomError, PresentResult};
use crate::present::PresentInfo;
use std::time::Duration;

/// Opaque handle to a primary or secondary command buffer owned by the device layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub u64);

/// Opaque handle to a binary semaphore.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub u64);

/// Opaque handle to a fence.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

impl FenceHandle {
    pub const NULL: FenceHandle = FenceHandle(0);
}

/// Opaque handle to a swapchain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SwapchainHandle(pub u64);

/// Bitmask of pipeline stages a semaphore wait applies to. Kept as a plain bitflag rather than
/// re-deriving the full Vulkan stage enum, since this crate never inspects individual bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStageMask(pub u32);

/// One queue index the device exposes; the index also doubles as the serial-tracking index
/// (`QueueSerial::index`) for work submitted on it.
pub type QueueIndex = usize;

/// What protection mode a submission should run under.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProtectionType {
    Unprotected,
    Protected,
    Invalid,
}

/// Which logical priority queue a submission targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Low, Priority::Medium, Priority::High];
}

/// Everything the device `Submit` primitive needs, gathered by `CommandQueue` from a
/// `CommandBatch` plus accumulated wait-semaphores.
#[derive(Clone, Debug, Default)]
pub struct SubmitInfo {
    pub wait_semaphores: smallvec::SmallVec<[SemaphoreHandle; 8]>,
    pub wait_stage_masks: smallvec::SmallVec<[PipelineStageMask; 8]>,
    pub command_buffers: smallvec::SmallVec<[CommandBufferHandle; 4]>,
    pub signal_semaphores: smallvec::SmallVec<[SemaphoreHandle; 4]>,
}

impl SubmitInfo {
    /// No primary buffer, no signal, no waits: the device call can be skipped entirely (§4.3
    /// step 3), though the batch is still produced for serial-ordering purposes.
    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty()
            && self.signal_semaphores.is_empty()
            && self.wait_semaphores.is_empty()
    }
}

/// The opaque GPU queue abstraction. `Submit`/`Present`/fence primitives as named in §6.
///
/// Implementors must be safe to call from multiple threads concurrently on different queue
/// indices; this crate serializes all calls to a single index through its own locks, but never
/// assumes the trait object itself needs no internal synchronization (a real driver queue is
/// itself internally synchronized, or is only ever reached through one `CommandQueue`).
pub trait DeviceApi: Send + Sync {
    fn submit(
        &self,
        queue: QueueIndex,
        info: &SubmitInfo,
        fence: FenceHandle,
    ) -> Result<(), Error>;

    fn present(
        &self,
        queue: QueueIndex,
        info: &PresentInfo,
    ) -> Result<PresentResult, Error>;

    fn create_fence(&self) -> Result<FenceHandle, OomError>;
    fn destroy_fence(&self, fence: FenceHandle);
    fn reset_fence(&self, fence: FenceHandle) -> Result<(), Error>;
    fn fence_status(&self, fence: FenceHandle) -> Result<bool, Error>;
    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<bool, Error>;
    fn queue_wait_idle(&self, queue: QueueIndex) -> Result<(), Error>;

    /// Exports a sync-fd from an already-signaled-or-pending fence. Only called for external
    /// fences of sync-fd type, and only after `submit` has returned successfully (§4.3 step 6).
    fn export_fence_fd(&self, fence: FenceHandle) -> Result<i32, Error>;
}
