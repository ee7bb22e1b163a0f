//! Error types and the deferred error bus used by the async front.
//!
//! Follows the style of the original `SubmitCommandBufferError`: plain enums with hand-written
//! `Display`/`std::error::Error` impls rather than a derive-macro error crate, since that is the
//! only error-handling precedent this lineage carries.

use crossbeam_queue::ArrayQueue;
use std::error;
use std::fmt;

/// Out-of-memory, surfaced the same way `vulkano`'s own `OomError` is: a thin wrapper so callers
/// can match on host-vs-device OOM without re-parsing a raw device result code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OomError {
    OutOfHostMemory,
    OutOfDeviceMemory,
}

impl fmt::Display for OomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OomError::OutOfHostMemory => write!(f, "no memory available on the host"),
            OomError::OutOfDeviceMemory => write!(f, "no memory available on the device"),
        }
    }
}

impl error::Error for OomError {}

/// Present outcomes surfaced through `SwapchainStatus::last_present_result` rather than as a
/// `Result` error, since by the time `CommandProcessor` learns the answer the caller that issued
/// `EnqueuePresent` has long since moved on and only polls the status cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentResult {
    Success,
    Suboptimal,
    /// The device call itself failed (not a swapchain-suboptimal/out-of-date condition). The
    /// underlying `Error` was also pushed onto the `ErrorBus`; this variant exists only so
    /// `SwapchainStatus` has something to clear `is_pending` with.
    Failed,
}

/// Every error this crate's device boundary, queue, and processor can produce.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Failure from the device abstraction's `submit`/`wait_fence`/`queue_wait_idle` calls.
    Oom(OomError),
    /// The device connection was lost. Terminal: the queue stops accepting new work.
    DeviceLost,
    /// A bounded wait did not complete within its timeout. Not surfaced as this variant by
    /// `WaitForResourceUseWithUserTimeout`, which reports timeout as a value instead.
    Timeout,
    /// The swapchain backing a present is out of date and must be recreated. Never recorded on
    /// the error bus; always surfaced via `SwapchainStatus::last_present_result`.
    OutOfDate,
    /// A present succeeded but the swapchain is suboptimal for the surface. Same handling as
    /// `OutOfDate`.
    Suboptimal,
    /// Two fence sources were supplied for one batch, or a batch with a primary buffer lacked a
    /// pool back-pointer. Programmer error at the call site, not a device failure.
    InvalidUsage(&'static str),
}

impl From<OomError> for Error {
    fn from(err: OomError) -> Self {
        Error::Oom(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Oom(err) => write!(f, "{}", err),
            Error::DeviceLost => write!(f, "the connection to the device has been lost"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::OutOfDate => write!(f, "swapchain is out of date"),
            Error::Suboptimal => write!(f, "swapchain is suboptimal"),
            Error::InvalidUsage(msg) => write!(f, "invalid usage: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Oom(err) => Some(err),
            _ => None,
        }
    }
}

impl Error {
    /// Present-specific non-fatal results are never pushed to the error bus; everything else is.
    pub fn is_present_status_only(&self) -> bool {
        matches!(self, Error::OutOfDate | Error::Suboptimal)
    }
}

/// One deferred error record, pushed by the worker thread and drained on the next caller-visible
/// `CommandProcessor` entry point.
#[derive(Clone, Debug)]
pub struct ErrorRecord {
    pub error: Error,
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
}

impl ErrorRecord {
    pub fn new(error: Error, file: &'static str, function: &'static str, line: u32) -> Self {
        ErrorRecord {
            error,
            file,
            function,
            line,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} at {}:{})",
            self.error, self.function, self.file, self.line
        )
    }
}

/// What a caller-visible `CommandProcessor` entry point should do after consulting the error bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorBusPoll {
    Continue,
    Stop,
}

/// Thread-safe bounded queue of deferred error records. Backed by `crossbeam_queue::ArrayQueue`,
/// the same crate `vulkano` itself already depends on, used here for the MPSC error-reporting
/// path instead of a parking_lot-guarded `Vec`.
pub struct ErrorBus {
    queue: ArrayQueue<ErrorRecord>,
}

impl ErrorBus {
    pub fn new(capacity: usize) -> Self {
        ErrorBus {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Pushes an error record. If the bus is full (pathological: more errors than capacity
    /// arrived before any caller drained them) the oldest record is dropped in favor of the
    /// newest, since callers must still see the most recent failure.
    pub fn push(&self, record: ErrorRecord) {
        if self.queue.push(record).is_err() {
            let _ = self.queue.pop();
            let _ = self.queue.push(self.queue_overflow_marker());
        }
    }

    fn queue_overflow_marker(&self) -> ErrorRecord {
        ErrorRecord::new(
            Error::InvalidUsage("error bus overflow, earlier errors were dropped"),
            file!(),
            "ErrorBus::push",
            line!(),
        )
    }

    pub fn pop(&self) -> Option<ErrorRecord> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains every pending record, forwarding each to `handler`, and returns `Stop` if at least
    /// one record was pending.
    pub fn check_and_pop_pending_error(
        &self,
        mut handler: impl FnMut(&ErrorRecord),
    ) -> ErrorBusPoll {
        let mut any = false;
        while let Some(record) = self.pop() {
            any = true;
            handler(&record);
        }
        if any {
            ErrorBusPoll::Stop
        } else {
            ErrorBusPoll::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bus_polls_continue() {
        let bus = ErrorBus::new(4);
        let mut seen = Vec::new();
        assert_eq!(
            bus.check_and_pop_pending_error(|r| seen.push(r.clone())),
            ErrorBusPoll::Continue
        );
        assert!(seen.is_empty());
    }

    #[test]
    fn pending_errors_poll_stop_exactly_once_per_batch() {
        let bus = ErrorBus::new(4);
        bus.push(ErrorRecord::new(Error::DeviceLost, "f", "g", 1));
        bus.push(ErrorRecord::new(Error::Timeout, "f", "g", 2));

        let mut seen = Vec::new();
        assert_eq!(
            bus.check_and_pop_pending_error(|r| seen.push(r.error)),
            ErrorBusPoll::Stop
        );
        assert_eq!(seen, vec![Error::DeviceLost, Error::Timeout]);

        // draining to empty, a second poll reports Continue
        assert_eq!(
            bus.check_and_pop_pending_error(|_| ()),
            ErrorBusPoll::Continue
        );
    }

    #[test]
    fn present_status_errors_are_not_fatal() {
        assert!(Error::OutOfDate.is_present_status_only());
        assert!(Error::Suboptimal.is_present_status_only());
        assert!(!Error::DeviceLost.is_present_status_only());
    }
}
