//! `Task`: the tagged variant describing one unit of queued work (§3, §4.5, §9 "Tagged task
//! variant").
//!
//! Rust's move semantics already give us the "moved-from value can't be double-used" property the
//! spec calls out as a C++ concern (resetting the source to `Invalid` after a move); `Task` is
//! consumed by value when dispatched, so there is no source left to double-use. `Invalid` is kept
//! as the `Default` placeholder variant, matching the spec's naming.

use crate::device::{
    CommandBufferHandle, PipelineStageMask, Priority, ProtectionType, SemaphoreHandle,
};
use crate::present::{PresentInfo, SwapchainStatus};
use crate::queue::OneOffSubmitPolicy;
use crate::serial::QueueSerial;
use smallvec::SmallVec;
use std::sync::Arc;

pub enum Task {
    FlushWaitSemaphores {
        protection: ProtectionType,
        priority: Priority,
        semaphores: SmallVec<[SemaphoreHandle; 8]>,
        stage_masks: SmallVec<[PipelineStageMask; 8]>,
    },
    ProcessOutsideRenderPassCommands {
        protection: ProtectionType,
        priority: Priority,
        command_buffer: CommandBufferHandle,
    },
    ProcessRenderPassCommands {
        protection: ProtectionType,
        priority: Priority,
        command_buffer: CommandBufferHandle,
    },
    FlushAndQueueSubmit {
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<SemaphoreHandle>,
        external_fence: Option<crate::device::FenceHandle>,
        serial: QueueSerial,
    },
    OneOffQueueSubmit {
        protection: ProtectionType,
        priority: Priority,
        command_buffer: CommandBufferHandle,
        wait_semaphore: Option<(SemaphoreHandle, PipelineStageMask)>,
        policy: OneOffSubmitPolicy,
        serial: QueueSerial,
    },
    Present {
        priority: Priority,
        present_info: PresentInfo,
        status: Arc<SwapchainStatus>,
    },
    /// Placeholder / moved-from marker. Never dispatched; `CommandProcessor` treats popping one
    /// as a no-op, logged at debug level since it should not occur in normal operation.
    #[allow(dead_code)]
    Invalid,
}

impl Default for Task {
    fn default() -> Self {
        Task::Invalid
    }
}

impl Task {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Task::FlushWaitSemaphores { .. } => "FlushWaitSemaphores",
            Task::ProcessOutsideRenderPassCommands { .. } => "ProcessOutsideRenderPassCommands",
            Task::ProcessRenderPassCommands { .. } => "ProcessRenderPassCommands",
            Task::FlushAndQueueSubmit { .. } => "FlushAndQueueSubmit",
            Task::OneOffQueueSubmit { .. } => "OneOffQueueSubmit",
            Task::Present { .. } => "Present",
            Task::Invalid => "Invalid",
        }
    }

    /// The serial this task is expected to make observably submitted, if any. Used by
    /// `waitForResourceUseToBeSubmitted` to decide whether popping another task is worth it.
    pub fn target_serial(&self) -> Option<QueueSerial> {
        match self {
            Task::FlushAndQueueSubmit { serial, .. } => Some(*serial),
            Task::OneOffQueueSubmit { serial, .. } => Some(*serial),
            _ => None,
        }
    }
}
