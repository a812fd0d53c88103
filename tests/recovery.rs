mod common;

use std::thread;
use std::time::Duration;

use common::*;
use pretty_assertions::assert_eq;
use rknpu::{ActionCode, DeviceConfig, HwConfig, JobFlags, NpuError};
use rknpu_protocol::regs::iommu;
use rknpu_sim::Behavior;

fn fast_timeout(hw: HwConfig) -> DeviceConfig {
    DeviceConfig {
        wait_attempts: 1,
        ..config(hw)
    }
}

#[test]
fn hung_job_times_out_and_resets_the_cores() {
    let rig = rig(fast_timeout(single_core(4095)));
    rig.sim.set_behavior(Behavior::Hang);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 3);

    let mut args = submit_args(tasks.handle, 3, 0x1);
    args.timeout_ms = 50;
    let err = rig.device.submit(&session, &args).unwrap_err();
    assert!(matches!(err, NpuError::Timeout { task_counter: 0 }));
    assert_eq!(err.errno(), -110);

    assert_eq!(rig.sim.reset.resets(), 1);
    assert!(!rig.sim.reset.any_asserted());
    assert_eq!(rig.device.engine().outstanding_jobs(), 0);
    let stats = rig.device.stats();
    assert_eq!(
        (stats.jobs_timed_out, stats.jobs_aborted, stats.soft_resets),
        (1, 1, 1)
    );

    // The core is usable again once it stops hanging.
    rig.sim.set_behavior(Behavior::Complete);
    let result = rig.device.submit(&session, &submit_args(tasks.handle, 3, 0x1)).unwrap();
    assert_eq!(result.task_counter, 3);
}

#[test]
fn mismatched_status_is_dropped_and_left_to_the_timeout() {
    let rig = rig(fast_timeout(single_core(4095)));
    rig.sim.set_behavior(Behavior::Status(0x3));
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 1);

    let mut args = submit_args(tasks.handle, 1, 0x1);
    args.timeout_ms = 50;
    let err = rig.device.submit(&session, &args).unwrap_err();
    assert!(err.is_timeout());
    let stats = rig.device.stats();
    assert_eq!(stats.mismatched_irqs, 1);
    assert_eq!(stats.jobs_completed, 0);
}

#[test]
fn bypassed_soft_reset_leaves_reset_lines_alone() {
    let rig = rig(DeviceConfig {
        bypass_soft_reset: true,
        ..fast_timeout(single_core(4095))
    });
    rig.sim.set_behavior(Behavior::Hang);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 1);

    let mut args = submit_args(tasks.handle, 1, 0x1);
    args.timeout_ms = 20;
    assert!(rig.device.submit(&session, &args).unwrap_err().is_timeout());
    assert_eq!(rig.sim.reset.resets(), 0);
    assert_eq!(rig.device.stats().soft_resets, 0);
}

/// Times out a blocking one-task job while a two-task job waits behind it on the same core.
fn time_out_with_a_job_queued_behind(rig: &Rig) -> NpuError {
    rig.sim.set_behavior(Behavior::Manual);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 2);

    thread::scope(|scope| {
        let stuck = scope.spawn(|| {
            let mut args = submit_args(tasks.handle, 1, 0x1);
            args.timeout_ms = 100;
            rig.device.submit(&session, &args)
        });
        assert!(wait_for(Duration::from_secs(5), || rig.sim.cores[0].in_flight().is_some()));
        let mut queued = submit_args(tasks.handle, 2, 0x1);
        queued.flags |= JobFlags::NONBLOCK;
        rig.device.submit(&session, &queued).unwrap();
        stuck.join().unwrap().unwrap_err()
    })
}

#[test]
fn timeout_reset_runs_the_job_queued_behind() {
    let rig = rig(fast_timeout(single_core(4095)));
    let err = time_out_with_a_job_queued_behind(&rig);
    assert!(err.is_timeout());
    assert_eq!(rig.sim.reset.resets(), 1);

    // The queued job was only committed once the reset was over.
    let lens: Vec<u32> = rig.sim.cores[0].batches().iter().map(|b| b.len).collect();
    assert_eq!(lens, vec![1, 2]);
    assert_eq!(rig.sim.cores[0].in_flight().map(|b| b.len), Some(2));
    assert_eq!(rig.device.engine().outstanding_jobs(), 1);

    assert!(rig.sim.cores[0].finish());
    settle(&rig.device);
    let stats = rig.device.stats();
    assert_eq!((stats.jobs_aborted, stats.jobs_completed), (1, 1));
}

#[test]
fn bypassed_reset_still_restarts_the_queue() {
    let rig = rig(DeviceConfig {
        bypass_soft_reset: true,
        ..fast_timeout(single_core(4095))
    });
    assert!(time_out_with_a_job_queued_behind(&rig).is_timeout());
    assert_eq!(rig.sim.reset.resets(), 0);
    assert_eq!(rig.sim.cores[0].in_flight().map(|b| b.len), Some(2));

    assert!(rig.sim.cores[0].finish());
    settle(&rig.device);
    assert_eq!(rig.device.stats().jobs_completed, 1);
}

#[test]
fn soft_reset_fails_running_async_jobs_and_restarts_queues() {
    let rig = rig(config(single_core(4095)));
    rig.sim.set_behavior(Behavior::Manual);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 2);

    let mut args = submit_args(tasks.handle, 1, 0x1);
    args.flags |= JobFlags::NONBLOCK;
    rig.device.submit(&session, &args).unwrap();
    args.task_number = 2;
    rig.device.submit(&session, &args).unwrap();
    assert_eq!(rig.sim.cores[0].batches().len(), 1);

    rig.device.soft_reset().unwrap();
    assert_eq!(rig.sim.reset.resets(), 1);

    // The running job is gone; the queued one was started after the reset.
    let batches = rig.sim.cores[0].batches();
    assert_eq!(batches.iter().map(|b| b.len).collect::<Vec<_>>(), vec![1, 2]);
    assert!(rig.sim.cores[0].finish());
    settle(&rig.device);
}

#[test]
fn soft_reset_wakes_a_blocked_submitter() {
    let rig = rig(config(single_core(4095)));
    rig.sim.set_behavior(Behavior::Manual);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 1);

    let err = thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            let mut args = submit_args(tasks.handle, 1, 0x1);
            args.timeout_ms = 10_000;
            rig.device.submit(&session, &args)
        });
        assert!(wait_for(Duration::from_secs(5), || rig.sim.cores[0].in_flight().is_some()));
        rig.device.soft_reset().unwrap();
        waiter.join().unwrap().unwrap_err()
    });
    assert!(matches!(err, NpuError::Aborted));
    assert_eq!(rig.device.engine().outstanding_jobs(), 0);
}

#[test]
fn soft_reset_revalidates_translation() {
    let rig = rig_with(config(single_core(4095)), true, 0);
    rig.device.action(ActionCode::PowerOn as u32, 0).unwrap();
    let core0 = &rig.sim.cores[0];
    let domain = rig.sim.iommu.as_ref().unwrap();
    let (attaches, detaches) = domain.attach_counts();
    assert_eq!(core0.reg(iommu::MMU0_BASE + iommu::DTE_ADDR) & iommu::DTE_VALID, 1);

    core0.set_reg(iommu::MMU0_BASE + iommu::DTE_ADDR, 0x0100_0000);
    core0.set_reg(iommu::MMU1_BASE + iommu::DTE_ADDR, 0x0100_0000);
    rig.device.soft_reset().unwrap();

    assert_eq!(domain.attach_counts(), (attaches + 1, detaches + 1));
    assert_eq!(core0.reg(iommu::MMU0_BASE + iommu::DTE_ADDR), 0x0100_0001);
    assert_eq!(core0.reg(iommu::MMU1_BASE + iommu::DTE_ADDR), 0x0100_0001);
}
