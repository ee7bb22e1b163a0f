//! End-to-end scenarios driven against `MockDevice` through the public crate surface, exercised
//! the way a caller embedding this crate would: `CommandPoolAccess` to stage work, then either
//! `CommandQueue` (synchronous) or `CommandProcessor` (async) to submit it.

use std::sync::Arc;
use std::time::Duration;

use vk_command_core::{
    CommandBufferHandle, CommandPoolAccess, CommandProcessor, CommandQueue, Config, Error,
    PresentInfo, Priority, ProtectionType, ResourceUse, Serial, SerialTracker, SwapchainHandle,
};
use vk_command_core::testing::MockDevice;

/// Safe to call from every test: `try_init` is a no-op (returns `Err`, ignored) if a logger is
/// already installed, which happens when multiple tests in this binary run in parallel.
fn init_logging() {
    let _ = env_logger::try_init();
}

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
fn single_submission_fence_signaled_completion() {
    init_logging();
    let device = Arc::new(MockDevice::new());
    let queue = new_queue(device.clone(), Config::default());

    queue
        .pool()
        .flush_outside_render_pass(ProtectionType::Unprotected, Priority::Low, CommandBufferHandle(1));
    let serial = queue
        .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
        .unwrap();

    assert_eq!(queue.serials().last_submitted(0), serial.serial);
    assert_eq!(queue.serials().last_completed(0), Serial::ZERO);

    let fence = device.submit_order()[0];
    device.signal_fence(fence);
    queue.check_completed();

    assert_eq!(queue.serials().last_completed(0), serial.serial);
    queue.release_finished_commands();
}

#[test]
fn backpressure_blocks_the_third_submission_until_the_first_fence_signals() {
    init_logging();
    let device = Arc::new(MockDevice::new());
    let config = Config {
        in_flight_capacity: 2,
        finished_capacity: 4,
        ..Config::default()
    };
    let queue = Arc::new(new_queue(device.clone(), config));

    let mut serials = Vec::new();
    for i in 0..2 {
        queue.pool().flush_outside_render_pass(
            ProtectionType::Unprotected,
            Priority::Low,
            CommandBufferHandle(i),
        );
        serials.push(
            queue
                .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
                .unwrap(),
        );
    }
    assert_eq!(serials[0].serial.raw(), 1);
    assert_eq!(serials[1].serial.raw(), 2);

    let oldest_fence = device.submit_order()[0];
    let queue2 = queue.clone();
    let device2 = device.clone();
    let third = std::thread::spawn(move || {
        queue2.pool().flush_outside_render_pass(
            ProtectionType::Unprotected,
            Priority::Low,
            CommandBufferHandle(2),
        );
        queue2
            .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
            .unwrap()
    });

    std::thread::sleep(Duration::from_millis(50));
    assert!(!third.is_finished());
    device2.signal_fence(oldest_fence);
    let serial3 = third.join().unwrap();

    assert_eq!(serial3.serial.raw(), 3);
    assert_eq!(queue.serials().last_submitted(0), Serial::from_raw(3));
}

#[test]
fn async_enqueue_order_is_preserved_regardless_of_worker_scheduling() {
    init_logging();
    let device = Arc::new(MockDevice::new());
    let queue = Arc::new(new_queue(device.clone(), Config::default()));
    let processor = CommandProcessor::new(queue.clone(), Config::default());

    let mut serials = Vec::new();
    for handle in [10u64, 20, 30] {
        processor
            .enqueue_process_outside_render_pass_commands(
                ProtectionType::Unprotected,
                Priority::Low,
                CommandBufferHandle(handle),
            )
            .unwrap();
        serials.push(
            processor
                .enqueue_submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
                .unwrap(),
        );
    }
    processor.wait_for_all_work_to_be_submitted().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while device.submit_count() < 3 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(device.submit_count(), 3);
    assert_eq!(serials[0].serial.raw(), 1);
    assert_eq!(serials[1].serial.raw(), 2);
    assert_eq!(serials[2].serial.raw(), 3);
}

#[test]
fn device_loss_during_in_flight_drains_and_forces_completion() {
    init_logging();
    let device = Arc::new(MockDevice::new());
    let config = Config {
        in_flight_capacity: 8,
        finished_capacity: 16,
        ..Config::default()
    };
    let queue = new_queue(device.clone(), config);

    for i in 0..5 {
        queue.pool().flush_outside_render_pass(
            ProtectionType::Unprotected,
            Priority::Low,
            CommandBufferHandle(i),
        );
        queue
            .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
            .unwrap();
    }
    device.signal_fence(device.submit_order()[0]);

    device.fail_next_submit(Error::DeviceLost);
    queue.pool().flush_outside_render_pass(
        ProtectionType::Unprotected,
        Priority::Low,
        CommandBufferHandle(99),
    );
    let err = queue
        .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
        .unwrap_err();
    assert_eq!(err, Error::DeviceLost);

    assert_eq!(queue.serials().last_completed(0), Serial::INFINITE);
    assert!(queue.is_device_lost());

    let err2 = queue
        .submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
        .unwrap_err();
    assert_eq!(err2, Error::DeviceLost);
}

#[test]
fn present_suboptimal_is_surfaced_on_swapchain_status_not_as_an_error() {
    init_logging();
    use vk_command_core::PresentResult;

    let device = Arc::new(MockDevice::new());
    device.set_present_result(PresentResult::Suboptimal);
    let queue = Arc::new(new_queue(device.clone(), Config::default()));
    let processor = CommandProcessor::new(queue.clone(), Config::default());

    let info = PresentInfo::new(SwapchainHandle(1), 0);
    let status = processor.enqueue_present(Priority::Low, info).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while status.is_pending() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(!status.is_pending());
    assert_eq!(status.last_present_result(), Some(PresentResult::Suboptimal));

    // a subsequent submission still succeeds: suboptimal is not treated as fatal
    queue.pool().flush_outside_render_pass(ProtectionType::Unprotected, Priority::Low, CommandBufferHandle(1));
    processor
        .enqueue_submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
        .unwrap();
}

#[test]
fn wait_for_resource_use_to_be_submitted_drives_the_queue_itself() {
    init_logging();
    let device = Arc::new(MockDevice::new());
    let config = Config {
        // a slow worker stands in for "the worker thread is paused": the caller's own steal
        // loop in `wait_for_resource_use_to_be_submitted` still has to make progress happen.
        slow_async_command_queue_for_testing: true,
        ..Config::default()
    };
    let queue = Arc::new(new_queue(device.clone(), config.clone()));
    let processor = CommandProcessor::new(queue.clone(), config);

    processor
        .enqueue_process_outside_render_pass_commands(
            ProtectionType::Unprotected,
            Priority::Low,
            CommandBufferHandle(7),
        )
        .unwrap();
    let serial = processor
        .enqueue_submit_commands(ProtectionType::Unprotected, Priority::Low, None, None)
        .unwrap();

    processor
        .wait_for_resource_use_to_be_submitted(&ResourceUse::single(serial))
        .unwrap();

    assert!(queue.serials().is_submitted(serial));
}
