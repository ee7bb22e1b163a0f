//! GPU command submission core: serial-ordered submit/present, fence-based completion tracking,
//! and an optional async offload to a worker thread.
//!
//! Recording command buffers, allocating device resources, and the driver API itself are out of
//! scope -- [`device::DeviceApi`] is the seam between this crate and that layer. What lives here
//! is the bookkeeping around submission order, in-flight/finished batch tracking, fence lifecycle,
//! and backpressure, synchronously via [`queue::CommandQueue`] or asynchronously via
//! [`processor::CommandProcessor`].

pub mod batch;
pub mod command_pool;
pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod present;
pub mod processor;
pub mod queue;
pub mod serial;
pub mod task;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use batch::{CommandBatch, FenceSource};
pub use command_pool::CommandPoolAccess;
pub use config::Config;
pub use device::{
    CommandBufferHandle, DeviceApi, FenceHandle, PipelineStageMask, Priority, ProtectionType,
    QueueIndex, SemaphoreHandle, SubmitInfo, SwapchainHandle,
};
pub use error::{Error, ErrorBus, ErrorBusPoll, ErrorRecord, OomError, PresentResult};
pub use fence::{FenceRecycler, SharedFence};
pub use present::{PresentExtension, PresentInfo, PresentMode, PresentRegion, Rect, SwapchainStatus};
pub use processor::{CommandProcessor, SecondaryBufferRecycler};
pub use queue::{CommandQueue, GarbageSource, OneOffSubmitPolicy};
pub use serial::{AtomicSerial, QueueSerial, ResourceUse, Serial, SerialTracker};
pub use task::Task;
