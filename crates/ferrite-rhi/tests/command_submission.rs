// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use ferrite_core::rhi::{NativeCommand, QueueStats, QueueType, ResourceId, RhiError, RhiSettings};
use ferrite_infra::{NullDevice, NullDeviceConfig};
use ferrite_rhi::{CommandListState, CommandQueue, RhiDevice};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn manual_device() -> Result<(Arc<NullDevice>, RhiDevice)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let native = NullDevice::new(NullDeviceConfig::manual())?;
    let device = RhiDevice::new(native.clone(), RhiSettings::default())?;
    Ok((native, device))
}

/// Runs `f` on its own thread and fails if it does not return in time.
fn within_timeout<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> Result<T> {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let _ = sender.send(f());
    });
    receiver
        .recv_timeout(Duration::from_secs(3))
        .map_err(|_| anyhow::anyhow!("the call did not return"))
}

/// Registers a removal callback that snapshots `queue` from inside the notification.
fn report_queue_stats_on_removal(
    device: &RhiDevice,
    queue: &Arc<CommandQueue>,
) -> crossbeam_channel::Receiver<QueueStats> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let observed = Arc::downgrade(queue);
    device.set_device_removed_callback(Box::new(move |_| {
        if let Some(queue) = observed.upgrade() {
            let _ = sender.send(queue.stats());
        }
    }));
    receiver
}

#[test]
fn allocator_is_not_reused_before_its_submission_completes() -> Result<()> {
    let (native, device) = manual_device()?;

    let allocator = device.obtain_allocator(QueueType::Direct)?;
    let first_id = allocator.id();
    let mut list = device.obtain_command_list(&allocator)?;
    for i in 0..5 {
        list.record(device.handle(), NativeCommand::Marker(format!("command {i}")))?;
    }
    list.close(device.handle())?;
    let point = device.execute_command_list(&mut list, false)?;
    assert_eq!(list.state(), CommandListState::Submitted);
    assert_eq!(point.value(), 1);
    device.release_command_list(list);
    device.release_allocator(allocator, point.clone());

    // The GPU has not reached the point, so a fresh allocator is created.
    let second = device.obtain_allocator(QueueType::Direct)?;
    assert_ne!(second.id(), first_id);
    assert!(native.allocator_reset_log().is_empty());

    assert!(native.complete_up_to(QueueType::Direct, point.value()));
    assert_eq!(native.executed_command_count(QueueType::Direct), 5);
    device.release_allocator(second, point.clone());

    let reused = device.obtain_allocator(QueueType::Direct)?;
    assert_eq!(reused.id(), first_id);
    let resets = native.allocator_reset_log();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].allocator, first_id);
    assert!(resets[0].last_batch <= resets[0].completed_batches);
    device.release_allocator(reused, point);
    Ok(())
}

#[test]
fn interleaved_contexts_never_reset_in_flight_allocators() -> Result<()> {
    let (native, device) = manual_device()?;
    let mut context = device.create_context(QueueType::Compute);

    let mut points = Vec::new();
    for round in 0..12 {
        context.record(NativeCommand::Dispatch {
            x: round + 1,
            y: 1,
            z: 1,
        })?;
        points.push(context.execute(false)?);
        // The GPU only catches up every third round.
        if round % 3 == 2 {
            let value = points.last().map_or(0, |p| p.value());
            assert!(native.complete_up_to(QueueType::Compute, value));
        }
    }
    context.flush()?;

    // The null device rejects in-flight resets, so reaching here with
    // recycled allocators shows every reset happened after completion.
    for reset in native.allocator_reset_log() {
        assert!(reset.last_batch <= reset.completed_batches);
    }
    let stats = device.queue(QueueType::Compute).stats();
    assert!(stats.allocators_created < 12);
    assert_eq!(native.executed_command_count(QueueType::Compute), 12);
    Ok(())
}

#[test]
fn cross_queue_wait_orders_copy_before_draw() -> Result<()> {
    let (native, device) = manual_device()?;
    let mut copy = device.create_context(QueueType::Copy);
    let mut direct = device.create_context(QueueType::Direct);

    copy.upload_to_resource(ResourceId(9), 0, &[1, 2, 3, 4])?;
    let uploaded = copy.execute(false)?;

    direct.wait_for(&uploaded)?;
    direct.draw(3, 1)?;
    let drawn = direct.execute(false)?;

    // The direct queue is stalled behind the copy queue.
    assert!(!native.complete_up_to(QueueType::Direct, drawn.value()));
    assert!(native.complete_up_to(QueueType::Copy, uploaded.value()));
    assert!(native.complete_up_to(QueueType::Direct, drawn.value()));
    drawn.wait()?;
    assert!(uploaded.poll()?);
    Ok(())
}

#[test]
fn waiting_on_an_unsignaled_value_is_rejected() -> Result<()> {
    let (_native, device) = manual_device()?;
    let fence = device.queue(QueueType::Copy).fence().clone();
    let err = fence.wait_for_value(fence.next_value()).unwrap_err();
    assert!(matches!(err, RhiError::InvalidArgument(_)));
    Ok(())
}

#[test]
fn device_removal_is_reported_once_and_recovered() -> Result<()> {
    let (native, mut device) = manual_device()?;
    let notified = Arc::new(AtomicUsize::new(0));
    {
        let notified = notified.clone();
        device.set_device_removed_callback(Box::new(move |reason| {
            assert_eq!(reason, "simulated page fault");
            notified.fetch_add(1, Ordering::Relaxed);
        }));
    }

    {
        let mut context = device.create_context(QueueType::Direct);
        context.draw(3, 1)?;
        native.inject_device_removal("simulated page fault");
        let err = context.execute(false).unwrap_err();
        assert!(err.is_device_removed());
        assert!(device.begin_frame().is_err());
    }
    assert!(device.is_lost());
    assert_eq!(notified.load(Ordering::Relaxed), 1);
    assert_eq!(
        device.removal_reason().as_deref(),
        Some("simulated page fault")
    );

    device.recreate()?;
    assert!(!device.is_lost());
    let mut context = device.create_context(QueueType::Direct);
    context.draw(3, 1)?;
    context.flush()?;
    assert!(!device.stats().device_lost);
    Ok(())
}

#[test]
fn removal_callback_can_read_queue_stats_during_signal() -> Result<()> {
    let (native, device) = manual_device()?;
    let queue = device.queue(QueueType::Direct).clone();
    let reports = report_queue_stats_on_removal(&device, &queue);

    queue.signal()?;
    native.inject_device_removal("hang during signal");
    let signaled = {
        let queue = queue.clone();
        within_timeout(move || queue.signal())?
    };
    assert!(signaled.is_err_and(|e| e.is_device_removed()));

    // The failed signal was rolled back before the callback ran.
    let stats = reports.try_recv()?;
    assert_eq!(stats.last_signaled, 1);
    assert!(device.is_lost());
    Ok(())
}

#[test]
fn removal_callback_can_read_queue_stats_during_obtain() -> Result<()> {
    let (native, device) = manual_device()?;
    let queue = device.queue(QueueType::Direct).clone();
    let reports = report_queue_stats_on_removal(&device, &queue);

    let allocator = queue.obtain_allocator()?;
    let point = queue.signal()?;
    queue.release_allocator(allocator, point);

    // The head is in flight, so obtaining polls the lost fence.
    native.inject_device_removal("hang during obtain");
    let obtained = {
        let queue = queue.clone();
        within_timeout(move || queue.obtain_allocator())?
    };
    assert!(obtained.is_err_and(|e| e.is_device_removed()));
    assert_eq!(reports.try_recv()?.allocators_pooled, 1);
    Ok(())
}

#[test]
fn completed_value_never_runs_ahead_of_last_signaled() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let native = NullDevice::new(NullDeviceConfig::default())?;
    let device = RhiDevice::new(native, RhiSettings::default())?;
    let queue = device.queue(QueueType::Compute);
    let fence = queue.fence();

    std::thread::scope(|scope| -> Result<()> {
        let signaler = scope.spawn(|| -> Result<(), RhiError> {
            for _ in 0..2000 {
                queue.signal()?;
            }
            Ok(())
        });
        while !signaler.is_finished() {
            let completed = fence.refresh_completed_value()?;
            let last = fence.last_signaled_value();
            assert!(completed <= last, "completed {completed} ahead of signaled {last}");
        }
        signaler
            .join()
            .map_err(|_| anyhow::anyhow!("signaler panicked"))??;
        Ok(())
    })?;
    device.wait_idle()?;
    Ok(())
}
