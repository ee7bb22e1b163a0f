//! Runtime-tunable knobs for the submission core. Unlike compile-time `cfg` feature flags, these
//! are plain fields so a host application can set them from its own config file/flags without
//! this crate depending on a config-parsing crate it has no other use for.

/// Suballocated garbage above this size triggers forced progress in `PostSubmitCheck`.
pub const DEFAULT_GARBAGE_SIZE_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// Default in-flight ring capacity. Must stay below `task_queue_capacity`'s finished-ring
/// counterpart so a full in-flight ring can always be migrated without reallocating.
pub const DEFAULT_IN_FLIGHT_CAPACITY: usize = 16;

/// Default finished-ring capacity. Must be >= `DEFAULT_IN_FLIGHT_CAPACITY` so `mNumAllCommands`
/// can reach full in-flight occupancy with zero finished batches and still have headroom.
pub const DEFAULT_FINISHED_CAPACITY: usize = 32;

/// Default bounded task-queue capacity for the async front.
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct Config {
    /// If set, command-buffer reset and garbage cleanup run on the worker thread rather than
    /// inline with the caller that pushed the work past the reclamation threshold.
    pub async_command_buffer_reset_and_garbage_cleanup: bool,
    /// Testing-only: the worker busy-waits ~5ms per task, used to make scheduling races
    /// reproducible. Never set this in production.
    pub slow_async_command_queue_for_testing: bool,
    /// Garbage byte threshold that triggers forced completion in `PostSubmitCheck`.
    pub garbage_size_limit_bytes: u64,
    /// Capacity of the in-flight batch ring.
    pub in_flight_capacity: usize,
    /// Capacity of the finished batch ring. Must be >= `in_flight_capacity`.
    pub finished_capacity: usize,
    /// Capacity of the `CommandProcessor` task ring.
    pub task_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            async_command_buffer_reset_and_garbage_cleanup: false,
            slow_async_command_queue_for_testing: false,
            garbage_size_limit_bytes: DEFAULT_GARBAGE_SIZE_LIMIT_BYTES,
            in_flight_capacity: DEFAULT_IN_FLIGHT_CAPACITY,
            finished_capacity: DEFAULT_FINISHED_CAPACITY,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    pub fn validate(&self) {
        assert!(
            self.finished_capacity >= self.in_flight_capacity,
            "finished_capacity ({}) must be >= in_flight_capacity ({})",
            self.finished_capacity,
            self.in_flight_capacity
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate();
    }

    #[test]
    #[should_panic]
    fn undersized_finished_ring_is_rejected() {
        let cfg = Config {
            in_flight_capacity: 8,
            finished_capacity: 4,
            ..Config::default()
        };
        cfg.validate();
    }
}
