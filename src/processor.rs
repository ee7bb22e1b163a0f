//! `CommandProcessor`: the asynchronous front over `CommandQueue` (§4.4).
//!
//! A bounded task ring plus one worker thread. Producers enqueue tagged [`Task`]s; if the ring is
//! full a producer sheds backpressure by popping and running the oldest task itself, on its own
//! thread, before pushing its own -- this preserves FIFO order without ever dropping work. Errors
//! that happen on the worker thread are deferred onto an [`ErrorBus`] and surfaced the next time
//! any public entry point is called, mirroring `checkAndPopPendingError` being the first thing
//! every upstream entry point does.

use crate::config::Config;
use crate::device::{CommandBufferHandle, FenceHandle, PipelineStageMask, Priority, ProtectionType, SemaphoreHandle};
use crate::error::{Error, ErrorBus, ErrorRecord, PresentResult};
use crate::present::{PresentInfo, SwapchainStatus};
use crate::queue::{CommandQueue, OneOffSubmitPolicy};
use crate::serial::{QueueSerial, ResourceUse};
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Hands a just-flushed secondary command-buffer helper back to whatever allocator the caller's
/// rendering layer uses for them. Recording and that allocator both live outside this crate's
/// scope (§1); this is the seam between "the buffer's contents are now in the primary" and
/// "the helper object itself is free for reuse."
pub trait SecondaryBufferRecycler: Send + Sync {
    fn recycle(&self, command_buffer: CommandBufferHandle);
}

struct TaskRing {
    enqueue_lock: Mutex<()>,
    dequeue: Mutex<VecDeque<Task>>,
    not_empty: Condvar,
    capacity: usize,
}

impl TaskRing {
    fn new(capacity: usize) -> Self {
        TaskRing {
            enqueue_lock: Mutex::new(()),
            dequeue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Pushes `task`. If the ring is already at capacity, first pops the oldest task and runs
    /// `on_shed` with it, synchronously, before pushing -- the producer pays for the backlog it
    /// caused rather than the ring growing unboundedly or a task being silently dropped.
    fn enqueue(&self, task: Task, mut on_shed: impl FnMut(Task)) {
        let _enqueue_guard = self.enqueue_lock.lock();
        let mut dq = self.dequeue.lock();
        if dq.len() >= self.capacity {
            if let Some(oldest) = dq.pop_front() {
                on_shed(oldest);
            }
        }
        dq.push_back(task);
        drop(dq);
        self.not_empty.notify_one();
    }

    /// Blocks until a task is available or `exit` is observed set with the ring empty.
    fn pop_blocking(&self, exit: &AtomicBool) -> Option<Task> {
        let mut dq = self.dequeue.lock();
        loop {
            if let Some(task) = dq.pop_front() {
                return Some(task);
            }
            if exit.load(Ordering::Acquire) {
                return None;
            }
            self.not_empty.wait(&mut dq);
        }
    }

    fn try_pop(&self) -> Option<Task> {
        self.dequeue.lock().pop_front()
    }

    fn request_shutdown(&self, exit: &AtomicBool) {
        exit.store(true, Ordering::Release);
        drop(self.dequeue.lock());
        self.not_empty.notify_all();
    }
}

fn record_error(bus: &ErrorBus, error: Error, function: &'static str) {
    log::error!("CommandProcessor: {} failed: {}", function, error);
    bus.push(ErrorRecord::new(error, file!(), function, line!()));
}

/// Runs one task to completion against `queue`, the same function whether called from the worker
/// thread or from a producer thread shedding backpressure or stealing work.
fn dispatch(
    queue: &CommandQueue,
    error_bus: &ErrorBus,
    recycler: Option<&dyn SecondaryBufferRecycler>,
    task: Task,
) {
    match task {
        Task::FlushWaitSemaphores {
            protection,
            priority,
            semaphores,
            stage_masks,
        } => {
            queue
                .pool()
                .flush_wait_semaphores(protection, priority, semaphores, stage_masks);
        }
        Task::ProcessOutsideRenderPassCommands {
            protection,
            priority,
            command_buffer,
        } => {
            queue.pool().flush_outside_render_pass(protection, priority, command_buffer);
            if let Some(recycler) = recycler {
                recycler.recycle(command_buffer);
            }
        }
        Task::ProcessRenderPassCommands {
            protection,
            priority,
            command_buffer,
        } => {
            queue.pool().flush_render_pass(protection, priority, command_buffer);
            if let Some(recycler) = recycler {
                recycler.recycle(command_buffer);
            }
        }
        Task::FlushAndQueueSubmit {
            protection,
            priority,
            signal_semaphore,
            external_fence,
            serial,
        } => {
            if let Err(err) = queue.submit_commands_reserved(
                serial,
                protection,
                priority,
                signal_semaphore,
                external_fence,
            ) {
                record_error(error_bus, err, "FlushAndQueueSubmit");
            }
        }
        Task::OneOffQueueSubmit {
            protection,
            priority,
            command_buffer,
            wait_semaphore,
            policy,
            serial,
        } => {
            if let Err(err) = queue.submit_one_off_reserved(
                serial,
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                policy,
            ) {
                record_error(error_bus, err, "OneOffQueueSubmit");
            }
        }
        Task::Present {
            priority,
            present_info,
            status,
        } => match queue.present(priority, &present_info) {
            Ok(result) => status.complete(result),
            Err(err) => {
                status.complete(PresentResult::Failed);
                record_error(error_bus, err, "Present");
            }
        },
        Task::Invalid => {
            log::debug!("CommandProcessor: popped an Invalid task, ignoring");
        }
    }
}

/// Asynchronous front over a `CommandQueue`: a bounded task ring, one worker thread, and a
/// deferred error bus. Every public entry point here checks the error bus first, matching
/// `checkAndPopPendingError` being the mandatory first call of every upstream entry point.
pub struct CommandProcessor {
    queue: Arc<CommandQueue>,
    tasks: Arc<TaskRing>,
    error_bus: Arc<ErrorBus>,
    exit: Arc<AtomicBool>,
    recycler: Option<Arc<dyn SecondaryBufferRecycler>>,
    worker: Option<JoinHandle<()>>,
}

impl CommandProcessor {
    pub fn new(queue: Arc<CommandQueue>, config: Config) -> Self {
        Self::with_recycler(queue, config, None)
    }

    pub fn with_recycler(
        queue: Arc<CommandQueue>,
        config: Config,
        recycler: Option<Arc<dyn SecondaryBufferRecycler>>,
    ) -> Self {
        let tasks = Arc::new(TaskRing::new(config.task_queue_capacity));
        let error_bus = Arc::new(ErrorBus::new(config.task_queue_capacity.max(8)));
        let exit = Arc::new(AtomicBool::new(false));

        let worker = {
            let queue = queue.clone();
            let tasks = tasks.clone();
            let error_bus = error_bus.clone();
            let exit = exit.clone();
            let recycler = recycler.clone();
            let slow = config.slow_async_command_queue_for_testing;
            thread::Builder::new()
                .name("command-processor".to_string())
                .spawn(move || {
                    while let Some(task) = tasks.pop_blocking(&exit) {
                        if slow {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        dispatch(&queue, &error_bus, recycler.as_deref(), task);
                    }
                })
                .expect("failed to spawn CommandProcessor worker thread")
        };

        CommandProcessor {
            queue,
            tasks,
            error_bus,
            exit,
            recycler,
            worker: Some(worker),
        }
    }

    fn check_and_pop_pending_error(&self) -> Result<(), Error> {
        let mut last = None;
        self.error_bus.check_and_pop_pending_error(|record| {
            log::warn!("CommandProcessor: deferred error surfaced: {}", record);
            last = Some(record.error);
        });
        match last {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn enqueue_task(&self, task: Task) {
        let queue = &self.queue;
        let error_bus = &self.error_bus;
        let recycler = self.recycler.as_deref();
        self.tasks
            .enqueue(task, |shed| dispatch(queue, error_bus, recycler, shed));
    }

    pub fn enqueue_flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        semaphores: SmallVec<[SemaphoreHandle; 8]>,
        stage_masks: SmallVec<[PipelineStageMask; 8]>,
    ) -> Result<(), Error> {
        self.check_and_pop_pending_error()?;
        self.enqueue_task(Task::FlushWaitSemaphores {
            protection,
            priority,
            semaphores,
            stage_masks,
        });
        Ok(())
    }

    pub fn enqueue_process_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: CommandBufferHandle,
    ) -> Result<(), Error> {
        self.check_and_pop_pending_error()?;
        self.enqueue_task(Task::ProcessOutsideRenderPassCommands {
            protection,
            priority,
            command_buffer,
        });
        Ok(())
    }

    pub fn enqueue_process_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: CommandBufferHandle,
    ) -> Result<(), Error> {
        self.check_and_pop_pending_error()?;
        self.enqueue_task(Task::ProcessRenderPassCommands {
            protection,
            priority,
            command_buffer,
        });
        Ok(())
    }

    /// Reserves a serial synchronously (so the caller can track the resulting `ResourceUse`
    /// immediately) and queues the actual device submission for the worker.
    pub fn enqueue_submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<SemaphoreHandle>,
        external_fence: Option<FenceHandle>,
    ) -> Result<QueueSerial, Error> {
        self.check_and_pop_pending_error()?;
        let serial = self.queue.reserve_serial();
        self.enqueue_task(Task::FlushAndQueueSubmit {
            protection,
            priority,
            signal_semaphore,
            external_fence,
            serial,
        });
        Ok(serial)
    }

    pub fn enqueue_submit_one_off(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: CommandBufferHandle,
        wait_semaphore: Option<(SemaphoreHandle, PipelineStageMask)>,
        policy: OneOffSubmitPolicy,
    ) -> Result<QueueSerial, Error> {
        self.check_and_pop_pending_error()?;
        let serial = self.queue.reserve_serial();
        self.enqueue_task(Task::OneOffQueueSubmit {
            protection,
            priority,
            command_buffer,
            wait_semaphore,
            policy,
            serial,
        });
        if policy == OneOffSubmitPolicy::EnsureSubmitted {
            self.wait_for_resource_use_to_be_submitted(&ResourceUse::single(serial))?;
        }
        Ok(serial)
    }

    pub fn enqueue_present(
        &self,
        priority: Priority,
        present_info: PresentInfo,
    ) -> Result<Arc<SwapchainStatus>, Error> {
        self.check_and_pop_pending_error()?;
        present_info
            .validate()
            .map_err(|_| Error::InvalidUsage("PresentInfo carries an invalid extension record"))?;
        let status = Arc::new(SwapchainStatus::new_pending());
        self.enqueue_task(Task::Present {
            priority,
            present_info,
            status: status.clone(),
        });
        Ok(status)
    }

    /// Pops and runs tasks from the calling thread until `use_` is observably submitted, rather
    /// than blocking on the worker. A caller that needs its own submission's serial to be visible
    /// right away (e.g. before it can safely merge it into a shared `ResourceUse`) drives the
    /// queue itself instead of waiting idle.
    pub fn wait_for_resource_use_to_be_submitted(&self, use_: &ResourceUse) -> Result<(), Error> {
        self.check_and_pop_pending_error()?;
        while !use_.is_submitted(self.queue.serials()) {
            match self.tasks.try_pop() {
                Some(task) => dispatch(
                    &self.queue,
                    &self.error_bus,
                    self.recycler.as_deref(),
                    task,
                ),
                None => std::thread::yield_now(),
            }
        }
        self.check_and_pop_pending_error()
    }

    pub fn wait_for_resource_use_to_finish(
        &self,
        use_: &ResourceUse,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.wait_for_resource_use_to_be_submitted(use_)?;
        self.queue.finish_resource_use(use_, timeout)
    }

    /// Drains the task ring from the calling thread, stealing whatever the worker hasn't already
    /// picked up. Does not wait for a task the worker is mid-execution of.
    pub fn wait_for_all_work_to_be_submitted(&self) -> Result<(), Error> {
        self.check_and_pop_pending_error()?;
        while let Some(task) = self.tasks.try_pop() {
            dispatch(&self.queue, &self.error_bus, self.recycler.as_deref(), task);
        }
        self.check_and_pop_pending_error()
    }

    pub fn wait_idle(&self, timeout: Duration) -> Result<(), Error> {
        self.wait_for_all_work_to_be_submitted()?;
        self.queue.wait_idle(timeout)
    }

    pub fn is_device_lost(&self) -> bool {
        self.queue.is_device_lost()
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        self.tasks.request_shutdown(&self.exit);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("CommandProcessor: worker thread panicked during shutdown");
            }
        }
    }
}
