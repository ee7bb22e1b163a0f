//! `CommandQueue`: the synchronous submission engine (§4.3).
//!
//! Three locks, acquired in a fixed outer-to-inner order when nested: `submit_lock` (entry to
//! submit/present), `in_flight` (the "complete" lock: fence polling, migration to the finished
//! ring), `finished` (the "release" lock: reclaiming finished batches). No operation holds two
//! non-adjacent locks simultaneously.

use crate::batch::{CommandBatch, FenceSource};
use crate::command_pool::CommandPoolAccess;
use crate::config::Config;
use crate::device::{
    CommandBufferHandle, DeviceApi, FenceHandle, PipelineStageMask, Priority, ProtectionType,
    QueueIndex, SemaphoreHandle, SubmitInfo,
};
use crate::error::{Error, PresentResult};
use crate::fence::{FenceRecycler, SharedFence};
use crate::present::PresentInfo;
use crate::serial::{QueueSerial, ResourceUse, Serial, SerialTracker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// How long a backpressure wait or a device-lost drain waits on one fence before giving up.
/// Finite so a hung driver can't wedge every caller forever; a real timeout here is treated as
/// device loss at the call site (§5 "Cancellation / timeout").
const DEFAULT_FENCE_WAIT: Duration = Duration::from_secs(5);

/// Signal emitted to the (out-of-scope) memory allocator: how much deferred-free garbage is
/// outstanding, and a request to collect everything keyed on a newly-completed serial.
pub trait GarbageSource: Send + Sync {
    fn garbage_size_bytes(&self) -> u64;
    fn collect_garbage(&self, last_completed: Serial);
}

/// Policy for `submit_one_off`: whether the caller needs the one-off's serial to be observably
/// submitted before the call returns (needed when the caller synchronizes against it outside the
/// normal submission order), or is content to let it land whenever the queue gets to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OneOffSubmitPolicy {
    EnsureSubmitted,
    NoWait,
}

pub struct CommandQueue {
    device: Arc<dyn DeviceApi>,
    pool: Arc<CommandPoolAccess>,
    fence_recycler: FenceRecycler,
    serials: Arc<SerialTracker>,
    index: usize,
    queue_index: QueueIndex,
    config: Config,
    garbage: Option<Arc<dyn GarbageSource>>,

    submit_lock: Mutex<()>,
    in_flight: Mutex<VecDeque<CommandBatch>>,
    finished: Mutex<VecDeque<CommandBatch>>,
    device_lost: std::sync::atomic::AtomicBool,
}

impl CommandQueue {
    pub fn new(
        device: Arc<dyn DeviceApi>,
        pool: Arc<CommandPoolAccess>,
        serials: Arc<SerialTracker>,
        index: usize,
        queue_index: QueueIndex,
        config: Config,
    ) -> Self {
        config.validate();
        CommandQueue {
            device,
            pool,
            fence_recycler: FenceRecycler::new(),
            serials,
            index,
            queue_index,
            config,
            garbage: None,
            submit_lock: Mutex::new(()),
            in_flight: Mutex::new(VecDeque::new()),
            finished: Mutex::new(VecDeque::new()),
            device_lost: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_garbage_source(mut self, garbage: Arc<dyn GarbageSource>) -> Self {
        self.garbage = Some(garbage);
        self
    }

    pub fn serials(&self) -> &SerialTracker {
        &self.serials
    }

    pub fn pool(&self) -> &Arc<CommandPoolAccess> {
        &self.pool
    }

    /// Reserves the next serial for this index without building or submitting a batch. Used by
    /// `CommandProcessor` to hand a caller a `QueueSerial` synchronously at enqueue time, before
    /// the actual submission has run on the worker thread (§4.4: resource tracking needs the
    /// serial immediately; the device call itself can lag behind).
    pub fn reserve_serial(&self) -> QueueSerial {
        QueueSerial::new(self.index, self.serials.reserve_next(self.index))
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(std::sync::atomic::Ordering::Acquire)
    }

    fn check_not_lost(&self) -> Result<(), Error> {
        if self.is_device_lost() {
            Err(Error::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// `isBusy`: lock-free, compares last-submitted against last-completed (§5 ordering
    /// guarantee 3).
    pub fn is_busy(&self) -> bool {
        self.serials.last_completed(self.index) < self.serials.last_submitted(self.index)
    }

    // ---- submission path (§4.3 "Submission path") ----

    pub fn submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<SemaphoreHandle>,
        external_fence: Option<FenceHandle>,
    ) -> Result<QueueSerial, Error> {
        self.check_not_lost()?;
        let queue_serial = self.reserve_serial();
        self.submit_commands_reserved(queue_serial, protection, priority, signal_semaphore, external_fence)?;
        Ok(queue_serial)
    }

    /// As `submit_commands`, but for a serial already reserved via `reserve_serial` (the
    /// `CommandProcessor` path, where the serial must be known before the worker gets around to
    /// actually running this submission).
    pub fn submit_commands_reserved(
        &self,
        queue_serial: QueueSerial,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<SemaphoreHandle>,
        external_fence: Option<FenceHandle>,
    ) -> Result<(), Error> {
        self.check_not_lost()?;
        let guard = self.submit_lock.lock();

        let serial = queue_serial.serial;
        let mut batch = CommandBatch::new(queue_serial, protection);

        let flushed = self
            .pool
            .get_commands_and_wait_semaphores(protection, priority);
        if let Some(primary) = flushed.primary {
            batch.set_primary(primary, &self.pool);
        }
        batch.set_secondary(flushed.secondary);

        let mut submit_info = SubmitInfo {
            wait_semaphores: flushed.wait_semaphores,
            wait_stage_masks: flushed.wait_stage_masks,
            ..Default::default()
        };
        if let Some(primary) = flushed.primary {
            submit_info.command_buffers.push(primary);
        }
        if let Some(sig) = signal_semaphore {
            submit_info.signal_semaphores.push(sig);
        }

        let needs_device_call =
            !submit_info.is_empty() || external_fence.is_some();

        let fence_source = self.acquire_fence(external_fence, needs_device_call)?;
        let fence_handle = fence_source
            .shared()
            .map(SharedFence::handle)
            .unwrap_or(FenceHandle::NULL);
        batch.set_fence(fence_source);

        // §4.3 step 5: drop the entry lock while resolving backpressure -- waiting on another
        // batch's fence must never block a concurrent caller from entering `submit_commands` on
        // an unrelated index, and must never be done while holding the lock the waited-for fence
        // depends on (the completion path).
        drop(guard);
        self.make_room_for_one_more()?;

        if needs_device_call {
            log::debug!(
                "CommandQueue::submit_commands: serial={:?} device call",
                queue_serial
            );
            if let Err(err) = self.device.submit(self.queue_index, &submit_info, fence_handle) {
                if err == Error::DeviceLost {
                    self.handle_device_lost();
                }
                return Err(err);
            }
            if let FenceSource::External(ref fence) = batch.fence() {
                // Export must happen strictly after the device `submit` call (§4.3 step 6).
                let _ = self.device.export_fence_fd(fence.handle());
            }
        }

        // §4.3 step 7 / §5 ordering guarantee 1: push before publishing `lastSubmitted`.
        self.in_flight.lock().push_back(batch);
        self.serials.mark_submitted(self.index, serial);

        Ok(())
    }

    pub fn submit_one_off(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: CommandBufferHandle,
        wait_semaphore: Option<(SemaphoreHandle, PipelineStageMask)>,
        policy: OneOffSubmitPolicy,
    ) -> Result<QueueSerial, Error> {
        self.check_not_lost()?;
        let queue_serial = self.reserve_serial();
        self.submit_one_off_reserved(queue_serial, protection, priority, command_buffer, wait_semaphore, policy)?;
        Ok(queue_serial)
    }

    /// As `submit_one_off`, but for a serial already reserved via `reserve_serial`.
    pub fn submit_one_off_reserved(
        &self,
        queue_serial: QueueSerial,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: CommandBufferHandle,
        wait_semaphore: Option<(SemaphoreHandle, PipelineStageMask)>,
        policy: OneOffSubmitPolicy,
    ) -> Result<(), Error> {
        let _ = priority; // one-off submissions bypass CommandPoolAccess entirely; priority is
                          // accepted only to match the upstream API shape (§6).
        self.check_not_lost()?;
        let serial = queue_serial.serial;
        let _guard = self.submit_lock.lock();

        // No pool back-pointer: this command buffer is caller-owned, not broker-owned, so
        // `CommandBatch::release` must not try to return it to a pool.
        let mut batch = CommandBatch::new(queue_serial, protection);

        let mut submit_info = SubmitInfo::default();
        submit_info.command_buffers.push(command_buffer);
        if let Some((sem, stage)) = wait_semaphore {
            submit_info.wait_semaphores.push(sem);
            submit_info.wait_stage_masks.push(stage);
        }

        let fence_source = self.acquire_fence(None, true)?;
        let fence_handle = fence_source
            .shared()
            .map(SharedFence::handle)
            .unwrap_or(FenceHandle::NULL);
        batch.set_fence(fence_source);

        drop(_guard);
        self.make_room_for_one_more()?;

        if let Err(err) = self.device.submit(self.queue_index, &submit_info, fence_handle) {
            if err == Error::DeviceLost {
                self.handle_device_lost();
            }
            return Err(err);
        }

        self.in_flight.lock().push_back(batch);
        self.serials.mark_submitted(self.index, serial);

        if policy == OneOffSubmitPolicy::EnsureSubmitted {
            // CommandQueue submits synchronously, so by this point the serial is already
            // observably submitted; this assertion documents the guarantee `CommandProcessor`
            // relies on rather than spinning for something already true.
            debug_assert!(self.serials.is_submitted(queue_serial));
        }

        Ok(())
    }

    pub fn present(&self, priority: Priority, info: &PresentInfo) -> Result<PresentResult, Error> {
        self.check_not_lost()?;
        info.validate()
            .map_err(|_| Error::InvalidUsage("PresentInfo carries an invalid extension record"))?;
        let _guard = self.submit_lock.lock();
        let _ = priority; // priority selects which device queue index backs this call; the
                          // mapping from Priority to a concrete QueueIndex lives with the caller
                          // that constructed this CommandQueue, so it is accepted here purely to
                          // match the upstream API shape (§6).
        match self.device.present(self.queue_index, info) {
            Ok(result) => Ok(result),
            Err(err) => {
                if err == Error::DeviceLost {
                    self.handle_device_lost();
                }
                Err(err)
            }
        }
    }

    fn acquire_fence(
        &self,
        external_fence: Option<FenceHandle>,
        needs_internal: bool,
    ) -> Result<FenceSource, Error> {
        match external_fence {
            Some(handle) => Ok(FenceSource::External(SharedFence::from_external(
                self.device.clone(),
                handle,
            ))),
            None if needs_internal => {
                let fence = SharedFence::fetch(self.device.clone(), &self.fence_recycler)?;
                Ok(FenceSource::Internal(fence))
            }
            None => Ok(FenceSource::None),
        }
    }

    /// §4.3 step 5: ensure there is room in both rings before the new batch is pushed.
    fn make_room_for_one_more(&self) -> Result<(), Error> {
        loop {
            let (in_flight_len, total_len) = {
                let in_flight = self.in_flight.lock();
                let finished = self.finished.lock();
                (in_flight.len(), in_flight.len() + finished.len())
            };
            if total_len >= self.config.finished_capacity {
                self.release_finished_commands();
                continue;
            }
            if in_flight_len >= self.config.in_flight_capacity {
                self.wait_oldest_in_flight(DEFAULT_FENCE_WAIT)?;
                continue;
            }
            return Ok(());
        }
    }

    fn wait_oldest_in_flight(&self, timeout: Duration) -> Result<(), Error> {
        let fence = {
            let in_flight = self.in_flight.lock();
            in_flight.front().and_then(|b| b.fence().shared().cloned())
        };
        if let Some(fence) = fence {
            // Wait with the lock dropped: the batch may be migrated/freed by another thread
            // while we wait, which is safe because we hold our own clone of the shared fence
            // (§9 "WaitFenceUnlocked").
            match fence.wait(timeout) {
                Ok(true) => {}
                Ok(false) => return Err(Error::Timeout),
                Err(Error::DeviceLost) => {
                    self.handle_device_lost();
                    return Err(Error::DeviceLost);
                }
                Err(err) => return Err(err),
            }
        }
        self.check_completed();
        Ok(())
    }

    // ---- completion path (§4.3 "Completion path") ----

    /// Polls the head of the in-flight ring; if signaled (or fenceless), advances
    /// `last_completed` and migrates it to the finished ring. Returns whether it migrated one.
    fn check_one_batch(&self) -> Result<bool, Error> {
        let mut in_flight = self.in_flight.lock();
        let signaled = match in_flight.front() {
            Some(batch) => match batch.fence().shared() {
                Some(fence) => fence.status()?,
                None => true,
            },
            None => return Ok(false),
        };
        if !signaled {
            return Ok(false);
        }
        let batch = in_flight.pop_front().expect("front checked above");
        drop(in_flight);
        self.serials
            .set_completed(batch.queue_serial.index, batch.queue_serial.serial);
        self.finished.lock().push_back(batch);
        Ok(true)
    }

    /// Repeats `check_one_batch` until a not-ready batch is found. Ordered fence signaling is
    /// assumed: submissions on one queue are serialized, so the head signals first.
    pub fn check_completed(&self) {
        loop {
            match self.check_one_batch() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    log::warn!("CommandQueue::check_completed: fence query failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Blocks until every `QueueSerial` in `use_` is finished, or `timeout` elapses.
    pub fn finish_resource_use(&self, use_: &ResourceUse, timeout: Duration) -> Result<(), Error> {
        let deadline = std::time::Instant::now() + timeout;
        let mut migrated_any = false;
        loop {
            if use_.is_finished(&self.serials) {
                break;
            }
            let fence = {
                let in_flight = self.in_flight.lock();
                match in_flight.front() {
                    None => break,
                    Some(batch) => batch.fence().shared().cloned(),
                }
            };
            match fence {
                Some(fence) if !fence.status()? => {
                    let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() {
                        if migrated_any {
                            self.release_finished_commands();
                        }
                        return Err(Error::Timeout);
                    }
                    match fence.wait(remaining) {
                        Ok(_) => {}
                        Err(Error::DeviceLost) => {
                            self.handle_device_lost();
                            return Err(Error::DeviceLost);
                        }
                        Err(err) => return Err(err),
                    }
                }
                _ => {}
            }
            if self.check_one_batch()? {
                migrated_any = true;
            }
        }
        if migrated_any {
            self.release_finished_commands();
        }
        Ok(())
    }

    /// Same as `finish_resource_use` but surfaces a timeout as a return value, not an error.
    pub fn wait_for_resource_use_with_user_timeout(
        &self,
        use_: &ResourceUse,
        timeout: Duration,
    ) -> Result<bool, Error> {
        match self.finish_resource_use(use_, timeout) {
            Ok(()) => Ok(true),
            Err(Error::Timeout) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn wait_idle(&self, timeout: Duration) -> Result<(), Error> {
        let tail_serial = {
            let _guard = self.submit_lock.lock();
            let in_flight = self.in_flight.lock();
            in_flight.back().map(|b| b.queue_serial)
        };
        match tail_serial {
            Some(qs) => self.finish_resource_use(&ResourceUse::single(qs), timeout),
            None => Ok(()),
        }
    }

    // ---- reclamation and garbage (§4.3 "Reclamation and garbage") ----

    /// Polls completed batches, then forces progress while outstanding garbage exceeds the
    /// configured threshold, always preserving at least one in-flight batch.
    pub fn post_submit_check(&self) {
        self.check_completed();
        let Some(garbage) = self.garbage.as_ref() else {
            return;
        };
        while garbage.garbage_size_bytes() > self.config.garbage_size_limit_bytes {
            if self.in_flight.lock().len() <= 1 {
                break;
            }
            if let Err(err) = self.wait_oldest_in_flight(DEFAULT_FENCE_WAIT) {
                log::warn!("CommandQueue::post_submit_check: forced progress failed: {}", err);
                break;
            }
            garbage.collect_garbage(self.serials.last_completed(self.index));
        }
    }

    /// Asynchronous-safe: may be invoked from the worker thread or directly. No-op on an empty
    /// finished ring.
    pub fn release_finished_commands(&self) {
        let mut finished = self.finished.lock();
        while let Some(mut batch) = finished.pop_front() {
            batch.release();
        }
    }

    // ---- device-lost ----

    /// Drains the in-flight ring under all three locks: waits each batch's fence with a bounded
    /// timeout (accepting device loss as success -- there is nothing further to wait for), then
    /// destroys it directly, bypassing the normal pool-return path. Forces `last_completed` to
    /// infinity so any outstanding `ResourceUse` reads as finished.
    pub fn handle_device_lost(&self) {
        if self
            .device_lost
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return; // already handled by another thread
        }
        let _submit_guard = self.submit_lock.lock();
        let mut in_flight = self.in_flight.lock();
        let mut finished = self.finished.lock();

        while let Some(mut batch) = in_flight.pop_front() {
            if let Some(fence) = batch.fence().shared() {
                match fence.wait(DEFAULT_FENCE_WAIT) {
                    Ok(_) | Err(Error::DeviceLost) => {}
                    Err(err) => log::warn!(
                        "CommandQueue::handle_device_lost: fence wait failed for {:?}: {}",
                        batch.queue_serial,
                        err
                    ),
                }
            }
            batch.destroy_on_device_lost();
        }
        self.serials.force_complete_all(self.index);

        while let Some(mut batch) = finished.pop_front() {
            batch.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Priority;
    use crate::testing::MockDevice;

    fn new_queue(device: Arc<MockDevice>, config: Config) -> CommandQueue {
        CommandQueue::new(
            device,
            Arc::new(CommandPoolAccess::new()),
            Arc::new(SerialTracker::new(1)),
            0,
            0,
            config,
        )
    }

    #[test]
    fn empty_submit_still_produces_a_batch_and_advances_serial() {
        let device = Arc::new(MockDevice::new());
        let queue = new_queue(device.clone(), Config::default());
        let qs = queue
            .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
            .unwrap();
        assert_eq!(qs.serial.raw(), 1);
        assert_eq!(queue.serials().last_submitted(0), qs.serial);
        // no primary, no signal, no waits -> device not actually called
        assert_eq!(device.submit_count(), 0);
    }

    #[test]
    fn single_submission_completes_once_fence_signaled() {
        let device = Arc::new(MockDevice::new());
        let queue = new_queue(device.clone(), Config::default());
        queue
            .pool
            .flush_outside_render_pass(ProtectionType::Unprotected, Priority::Low, CommandBufferHandle(1));
        let qs = queue
            .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
            .unwrap();
        assert_eq!(device.submit_count(), 1);
        assert_eq!(queue.serials().last_submitted(0), qs.serial);
        assert_eq!(queue.serials().last_completed(0), Serial::ZERO);

        let fence = device.submit_order()[0];
        device.signal_fence(fence);
        queue.check_completed();
        assert_eq!(queue.serials().last_completed(0), qs.serial);
        assert_eq!(queue.finished.lock().len(), 1);
        queue.release_finished_commands();
        assert_eq!(queue.finished.lock().len(), 0);
    }

    #[test]
    fn backpressure_blocks_until_oldest_fence_signals() {
        let device = Arc::new(MockDevice::new());
        let config = Config {
            in_flight_capacity: 2,
            finished_capacity: 4,
            ..Config::default()
        };
        let queue = Arc::new(new_queue(device.clone(), config));

        for _ in 0..2 {
            queue
                .pool
                .flush_outside_render_pass(ProtectionType::Unprotected, Priority::Low, CommandBufferHandle(1));
            queue
                .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
                .unwrap();
        }
        assert_eq!(queue.in_flight.lock().len(), 2);

        let oldest_fence = device.submit_order()[0];
        let queue2 = queue.clone();
        let device2 = device.clone();
        let handle = std::thread::spawn(move || {
            queue2
                .pool
                .flush_outside_render_pass(ProtectionType::Unprotected, Priority::Low, CommandBufferHandle(1));
            queue2
                .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
                .unwrap()
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        device2.signal_fence(oldest_fence);
        let qs3 = handle.join().unwrap();

        assert_eq!(qs3.serial.raw(), 3);
        assert_eq!(queue.serials().last_submitted(0), Serial::from_raw(3));
        assert_eq!(queue.in_flight.lock().len(), 2);
    }

    #[test]
    fn device_lost_drains_in_flight_and_forces_completion() {
        let device = Arc::new(MockDevice::new());
        let config = Config {
            in_flight_capacity: 8,
            finished_capacity: 16,
            ..Config::default()
        };
        let queue = new_queue(device.clone(), config);

        for _ in 0..5 {
            queue
                .pool
                .flush_outside_render_pass(ProtectionType::Unprotected, Priority::Low, CommandBufferHandle(1));
            queue
                .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
                .unwrap();
        }
        let fences = device.submit_order();
        device.signal_fence(fences[0]);

        device.fail_next_submit(Error::DeviceLost);
        queue
            .pool
            .flush_outside_render_pass(ProtectionType::Unprotected, Priority::Low, CommandBufferHandle(1));
        let err = queue
            .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
            .unwrap_err();
        assert_eq!(err, Error::DeviceLost);

        assert!(queue.in_flight.lock().is_empty());
        assert_eq!(queue.serials().last_completed(0), Serial::INFINITE);
        assert!(queue.is_device_lost());

        let err2 = queue
            .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
            .unwrap_err();
        assert_eq!(err2, Error::DeviceLost);
    }

    #[test]
    fn present_suboptimal_is_not_an_error() {
        let device = Arc::new(MockDevice::new());
        device.set_present_result(PresentResult::Suboptimal);
        let queue = new_queue(device.clone(), Config::default());
        let info = PresentInfo::new(crate::device::SwapchainHandle(1), 0);
        let result = queue.present(Priority::Low, &info).unwrap();
        assert_eq!(result, PresentResult::Suboptimal);
    }
}
