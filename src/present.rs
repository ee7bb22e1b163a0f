//! The present path: `PresentInfo` (bit-exact per §6) and `SwapchainStatus`.

use crate::device::{FenceHandle, SemaphoreHandle, SwapchainHandle};
use crate::error::PresentResult;
use parking_lot::Mutex;
use smallvec::SmallVec;

/// A rectangle list restricting which regions of the image actually changed.
#[derive(Clone, Debug, Default)]
pub struct PresentRegion {
    pub rectangles: SmallVec<[Rect; 4]>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Which present mode to use for this present only, overriding the swapchain's default.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentMode {
    Fifo,
    Mailbox,
    Immediate,
}

/// The three extension records `PresentInfo` permits, and nothing else (§6).
#[derive(Clone, Debug)]
pub enum PresentExtension {
    Regions(PresentRegion),
    Fence(FenceHandle),
    Mode(PresentMode),
}

/// One present call's worth of arguments. Exactly one swapchain/image-index pair, zero or one
/// wait semaphore, and zero or more of the three permitted extension records -- anything else is
/// rejected by `PresentInfo::validate` rather than silently accepted.
#[derive(Clone, Debug)]
pub struct PresentInfo {
    pub swapchain: SwapchainHandle,
    pub image_index: u32,
    pub wait_semaphore: Option<SemaphoreHandle>,
    pub extensions: SmallVec<[PresentExtension; 2]>,
}

impl PresentInfo {
    pub fn new(swapchain: SwapchainHandle, image_index: u32) -> Self {
        PresentInfo {
            swapchain,
            image_index,
            wait_semaphore: None,
            extensions: SmallVec::new(),
        }
    }

    /// §6: "the only permitted extension records are present-regions ..., present-fence-info
    /// ..., and present-mode-info ...; any other extension type is an error." Since
    /// `PresentExtension` is a closed enum there is no "other" variant to reject at the type
    /// level; this validates the documented *cardinality* constraints instead: at most one of
    /// each extension kind.
    pub fn validate(&self) -> Result<(), &'static str> {
        let mut seen_regions = false;
        let mut seen_fence = false;
        let mut seen_mode = false;
        for ext in &self.extensions {
            match ext {
                PresentExtension::Regions(_) => {
                    if seen_regions {
                        return Err("duplicate present-regions extension");
                    }
                    seen_regions = true;
                }
                PresentExtension::Fence(_) => {
                    if seen_fence {
                        return Err("duplicate present-fence-info extension");
                    }
                    seen_fence = true;
                }
                PresentExtension::Mode(_) => {
                    if seen_mode {
                        return Err("duplicate present-mode-info extension");
                    }
                    seen_mode = true;
                }
            }
        }
        Ok(())
    }
}

/// Shared status cell for one `EnqueuePresent` call. The worker clears `is_pending` after making
/// the device call; the owner may free this struct once `is_pending` observes `false`, and the
/// worker must not touch it afterward (it doesn't hold a reference past the clear).
#[derive(Debug)]
pub struct SwapchainStatus {
    state: Mutex<SwapchainStatusState>,
}

#[derive(Debug, Clone, Copy)]
struct SwapchainStatusState {
    is_pending: bool,
    last_present_result: Option<PresentResult>,
}

impl Default for SwapchainStatus {
    fn default() -> Self {
        SwapchainStatus {
            state: Mutex::new(SwapchainStatusState {
                is_pending: true,
                last_present_result: None,
            }),
        }
    }
}

impl SwapchainStatus {
    pub fn new_pending() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().is_pending
    }

    pub fn last_present_result(&self) -> Option<PresentResult> {
        self.state.lock().last_present_result
    }

    /// Called by the worker exactly once, right after the device `present` call returns.
    pub(crate) fn complete(&self, result: PresentResult) {
        let mut state = self.state.lock();
        state.last_present_result = Some(result);
        state.is_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_present_info_has_no_wait_and_no_extensions() {
        let info = PresentInfo::new(SwapchainHandle(1), 0);
        assert!(info.wait_semaphore.is_none());
        assert!(info.extensions.is_empty());
        assert!(info.validate().is_ok());
    }

    #[test]
    fn duplicate_extension_kind_is_rejected() {
        let mut info = PresentInfo::new(SwapchainHandle(1), 0);
        info.extensions.push(PresentExtension::Mode(PresentMode::Fifo));
        info.extensions.push(PresentExtension::Mode(PresentMode::Mailbox));
        assert!(info.validate().is_err());
    }

    #[test]
    fn status_starts_pending_then_completes() {
        let status = SwapchainStatus::new_pending();
        assert!(status.is_pending());
        assert!(status.last_present_result().is_none());
        status.complete(PresentResult::Suboptimal);
        assert!(!status.is_pending());
        assert_eq!(status.last_present_result(), Some(PresentResult::Suboptimal));
    }
}
