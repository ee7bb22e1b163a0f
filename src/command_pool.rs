//! `CommandPoolAccess`: the thread-safe broker owning per-(priority, protection) command-buffer
//! accumulators and the persistent primary-buffer pools they draw from (§4.2).
//!
//! Recording into buffers is out of scope (§1); this module only tracks the handles and the
//! pool-reuse bookkeeping around them.

use crate::device::{CommandBufferHandle, PipelineStageMask, Priority, ProtectionType, SemaphoreHandle};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-progress primary buffer plus everything accumulated against it since the last flush to
/// the device. Invariant (§3): `primary.is_some() || secondary.is_empty()`.
#[derive(Default)]
struct CommandsState {
    primary: Option<CommandBufferHandle>,
    secondary: SmallVec<[CommandBufferHandle; 8]>,
    wait_semaphores: SmallVec<[SemaphoreHandle; 8]>,
    wait_stage_masks: SmallVec<[PipelineStageMask; 8]>,
}

impl CommandsState {
    fn check_invariant(&self) {
        debug_assert!(self.primary.is_some() || self.secondary.is_empty());
    }
}

/// A persistent pool of primary command buffers for one protection type. Handles are synthetic
/// (recording/allocation is out of scope); the pool only tracks which are free for reuse.
struct PrimaryPool {
    free: Vec<CommandBufferHandle>,
    next_id: AtomicU64,
    initialized: bool,
}

impl PrimaryPool {
    fn new() -> Self {
        PrimaryPool {
            free: Vec::new(),
            next_id: AtomicU64::new(1),
            initialized: false,
        }
    }

    fn allocate(&mut self) -> CommandBufferHandle {
        self.free.pop().unwrap_or_else(|| {
            CommandBufferHandle(self.next_id.fetch_add(1, Ordering::Relaxed))
        })
    }

    fn collect(&mut self, buf: CommandBufferHandle) {
        self.free.push(buf);
    }
}

/// Output of [`CommandPoolAccess::get_commands_and_wait_semaphores`]: everything a
/// `CommandQueue` submission needs from the pool broker for one (priority, protection) pair.
pub struct FlushedCommands {
    pub primary: Option<CommandBufferHandle>,
    pub secondary: SmallVec<[CommandBufferHandle; 8]>,
    pub wait_semaphores: SmallVec<[SemaphoreHandle; 8]>,
    pub wait_stage_masks: SmallVec<[PipelineStageMask; 8]>,
}

impl FlushedCommands {
    fn empty() -> Self {
        FlushedCommands {
            primary: None,
            secondary: SmallVec::new(),
            wait_semaphores: SmallVec::new(),
            wait_stage_masks: SmallVec::new(),
        }
    }
}

const PROTECTION_COUNT: usize = 2;
const PRIORITY_COUNT: usize = 3;

fn protection_index(protection: ProtectionType) -> usize {
    match protection {
        ProtectionType::Unprotected => 0,
        ProtectionType::Protected => 1,
        ProtectionType::Invalid => panic!("ProtectionType::Invalid has no pool slot"),
    }
}

fn priority_index(priority: Priority) -> usize {
    match priority {
        Priority::Low => 0,
        Priority::Medium => 1,
        Priority::High => 2,
    }
}

struct Inner {
    pools: [PrimaryPool; PROTECTION_COUNT],
    // [protection][priority]
    states: [[CommandsState; PRIORITY_COUNT]; PROTECTION_COUNT],
}

impl Inner {
    fn new() -> Self {
        Inner {
            pools: [PrimaryPool::new(), PrimaryPool::new()],
            states: Default::default(),
        }
    }

    fn ensure_primary(&mut self, protection: ProtectionType, priority: Priority) -> CommandBufferHandle {
        let p = protection_index(protection);
        let state = &mut self.states[p][priority_index(priority)];
        if let Some(existing) = state.primary {
            existing
        } else {
            let handle = self.pools[p].allocate();
            let state = &mut self.states[p][priority_index(priority)];
            state.primary = Some(handle);
            handle
        }
    }
}

/// Thread-safe broker owning the primary-buffer pools and per-(priority, protection)
/// accumulators. Every operation is serialized on one internal mutex (§4.2).
pub struct CommandPoolAccess {
    inner: Mutex<Inner>,
}

impl CommandPoolAccess {
    pub fn new() -> Self {
        CommandPoolAccess {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Idempotent; marks the pool for `protection` as created.
    pub fn init_pool(&self, protection: ProtectionType) {
        let mut inner = self.inner.lock();
        inner.pools[protection_index(protection)].initialized = true;
    }

    /// Ensures the target state has a valid primary, then appends `buf`'s recorded contents
    /// (tracked here only as its handle) into it. `buf` is consumed.
    pub fn flush_outside_render_pass(
        &self,
        protection: ProtectionType,
        priority: Priority,
        buf: CommandBufferHandle,
    ) {
        let mut inner = self.inner.lock();
        inner.ensure_primary(protection, priority);
        let state = &mut inner.states[protection_index(protection)][priority_index(priority)];
        state.secondary.push(buf);
        state.check_invariant();
    }

    /// As `flush_outside_render_pass`, wrapping a render-pass scope. The pass/framebuffer
    /// override are out of scope for this core (recording internals); only the resulting
    /// secondary handle is tracked.
    pub fn flush_render_pass(
        &self,
        protection: ProtectionType,
        priority: Priority,
        buf: CommandBufferHandle,
    ) {
        self.flush_outside_render_pass(protection, priority, buf);
    }

    /// Appends to the state's wait-semaphore vectors. Inputs are moved in, never retained by the
    /// caller afterward.
    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        semaphores: SmallVec<[SemaphoreHandle; 8]>,
        stage_masks: SmallVec<[PipelineStageMask; 8]>,
    ) {
        let mut inner = self.inner.lock();
        let state = &mut inner.states[protection_index(protection)][priority_index(priority)];
        state.wait_semaphores.extend(semaphores);
        state.wait_stage_masks.extend(stage_masks);
    }

    /// Ends the current primary buffer and hands its ownership, plus the accumulated secondary
    /// buffers and wait-semaphores, to the caller. The state is reset to empty.
    pub fn get_commands_and_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
    ) -> FlushedCommands {
        let mut inner = self.inner.lock();
        let p = protection_index(protection);
        let pi = priority_index(priority);
        let state = std::mem::take(&mut inner.states[p][pi]);
        state.check_invariant();
        if state.primary.is_none() && state.secondary.is_empty() && state.wait_semaphores.is_empty() {
            return FlushedCommands::empty();
        }
        FlushedCommands {
            primary: state.primary,
            secondary: state.secondary,
            wait_semaphores: state.wait_semaphores,
            wait_stage_masks: state.wait_stage_masks,
        }
    }

    /// Returns a completed primary buffer to its pool for reset and reuse.
    pub fn collect_primary(&self, protection: ProtectionType, buf: CommandBufferHandle) {
        let mut inner = self.inner.lock();
        inner.pools[protection_index(protection)].collect(buf);
    }

    /// Unconditionally destroys a primary buffer (used on device-lost); never returned to a pool.
    pub fn destroy_primary(&self, _buf: CommandBufferHandle) {
        // Recording/allocation lives in the (out of scope) device layer; here destruction is a
        // no-op beyond simply not recycling the handle.
    }
}

impl Default for CommandPoolAccess {
    fn default() -> Self {
        Self::new()
    }
}
