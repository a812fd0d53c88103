mod common;

use std::time::Duration;

use common::*;
use pretty_assertions::assert_eq;
use rknpu::{HwConfig, IrqOutcome, JobFlags, SubcoreTask};
use rknpu_protocol::regs::{engine, pc};
use rknpu_sim::Behavior;

#[test]
fn long_job_runs_in_hardware_sized_batches() -> anyhow::Result<()> {
    let rig = rig(config(single_core(4)));
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 10);

    let result = rig.device.submit(&session, &submit_args(tasks.handle, 10, 0x1))?;
    assert_eq!(result.task_counter, 10);
    assert_eq!(result.core_mask, 0x1);

    let batches = rig.sim.cores[0].batches();
    assert_eq!(batches.iter().map(|b| b.len).collect::<Vec<_>>(), vec![4, 4, 2]);
    for (batch, first) in batches.iter().zip([0u32, 4, 8]) {
        assert_eq!(batch.data_addr, regcmd_addr(first) as u32);
        assert_eq!(batch.int_mask, DONE_MASK);
        // A zero base address falls back to the task buffer.
        assert_eq!(batch.dma_base, tasks.dma_addr as u32);
        assert_eq!(batch.data_amount, (108 + 4 + 1) / 2 - 1);
    }
    assert_eq!(rig.sim.cores[0].task_counter(), 10);
    assert_eq!(rig.device.stats().batches_committed, 3);
    Ok(())
}

#[test]
fn commit_switches_to_slave_mode_and_pulses_start() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 2);
    rig.sim.cores[0].clear_log();

    let mut args = submit_args(tasks.handle, 2, 0x1);
    args.flags |= JobFlags::PINGPONG;
    args.task_base_addr = 0x3000_0000;
    rig.device.submit(&session, &args).unwrap();

    let writes: Vec<(u32, u32)> = rig.sim.cores[0]
        .writes()
        .into_iter()
        .take_while(|(offset, _)| *offset != pc::OP_EN)
        .collect();
    assert_eq!(
        writes,
        vec![
            (pc::DATA_ADDR, 1),
            (pc::DATA_ADDR, regcmd_addr(0) as u32),
            (pc::DATA_AMOUNT, 55),
            (pc::INT_MASK, DONE_MASK),
            (pc::INT_CLEAR, DONE_MASK),
            (pc::TASK_CONTROL, (0x7 << 12) | 2),
            (pc::DMA_BASE_ADDR, 0x3000_0000),
            (pc::INT_CLEAR, 0x1ffff),
        ]
    );
}

#[test]
fn two_core_job_splits_by_subcore_slots() {
    let rig = rig(config(HwConfig::rk3588()));
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 5);

    let mut args = submit_args(tasks.handle, 5, 0x3);
    args.subcore_task[0] = SubcoreTask { task_start: 0, task_number: 3 };
    args.subcore_task[1] = SubcoreTask { task_start: 3, task_number: 2 };
    let result = rig.device.submit(&session, &args).unwrap();

    assert_eq!(result.task_counter, 5);
    assert_eq!(result.core_mask, 0x3);
    let core0 = rig.sim.cores[0].batches();
    let core1 = rig.sim.cores[1].batches();
    assert_eq!((core0.len(), core0[0].len), (1, 3));
    assert_eq!((core1.len(), core1[0].len), (1, 2));
    assert_eq!(core1[0].data_addr, regcmd_addr(3) as u32);
    assert!(rig.sim.cores[2].batches().is_empty());

    // Each core's engine pointers are primed with its own index.
    assert!(rig.sim.cores[1]
        .writes()
        .contains(&(engine::CNA_S_POINTER, 0x1000_000e)));
}

#[test]
fn multi_core_job_without_slots_shares_its_tasks() {
    let rig = rig(config(HwConfig::rk3588()));
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 5);

    let result = rig.device.submit(&session, &submit_args(tasks.handle, 5, 0x3)).unwrap();
    assert_eq!(result.task_counter, 5);
    let core0 = rig.sim.cores[0].batches();
    let core1 = rig.sim.cores[1].batches();
    assert_eq!((core0.len(), core0[0].len), (1, 3));
    assert_eq!((core1.len(), core1[0].len), (1, 2));
    assert_eq!(core1[0].data_addr, regcmd_addr(3) as u32);
    let executed: u32 = rig.sim.cores.iter().flat_map(|c| c.batches()).map(|b| b.len).sum();
    assert_eq!(executed, result.task_counter);
}

#[test]
fn three_core_job_reads_upper_subcore_slots() {
    let rig = rig(config(HwConfig::rk3588()));
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 6);

    let mut args = submit_args(tasks.handle, 6, 0x7);
    args.subcore_task[2] = SubcoreTask { task_start: 0, task_number: 1 };
    args.subcore_task[3] = SubcoreTask { task_start: 1, task_number: 2 };
    args.subcore_task[4] = SubcoreTask { task_start: 3, task_number: 3 };
    let result = rig.device.submit(&session, &args).unwrap();

    assert_eq!(result.task_counter, 6);
    let lens: Vec<u32> = rig.sim.cores.iter().map(|c| c.batches()[0].len).collect();
    assert_eq!(lens, vec![1, 2, 3]);
    assert_eq!(rig.sim.cores[2].batches()[0].data_addr, regcmd_addr(3) as u32);
}

#[test]
fn automatic_selection_spreads_jobs_by_load() {
    let rig = rig(config(HwConfig::rk3588()));
    rig.sim.set_behavior(Behavior::Manual);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 5);

    let mut picked = Vec::new();
    for count in [5, 3, 1, 2] {
        let mut args = submit_args(tasks.handle, count, 0);
        args.flags |= JobFlags::NONBLOCK;
        let result = rig.device.submit(&session, &args).unwrap();
        assert_eq!(result.task_counter, 0);
        picked.push(result.core_mask);
    }
    // Loads 0/0/0 -> core 0, 5/0/0 -> core 1, 5/3/0 -> core 2, 5/3/1 -> core 2.
    assert_eq!(picked, vec![0x1, 0x2, 0x4, 0x4]);

    for core in &rig.sim.cores {
        assert!(core.finish());
    }
    assert!(wait_for(Duration::from_secs(5), || rig.sim.cores[2].in_flight().is_some()));
    assert!(rig.sim.cores[2].finish());
    settle(&rig.device);
    assert_eq!(rig.device.stats().jobs_completed, 4);
}

#[test]
fn jobs_on_one_core_run_in_submission_order() {
    let rig = rig(config(single_core(4095)));
    rig.sim.set_behavior(Behavior::Manual);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 3);

    for count in [1, 2, 3] {
        let mut args = submit_args(tasks.handle, count, 0x1);
        args.flags |= JobFlags::NONBLOCK;
        rig.device.submit(&session, &args).unwrap();
    }
    for expected in [1, 2, 3] {
        assert!(wait_for(Duration::from_secs(5), || rig.sim.cores[0].in_flight().is_some()));
        assert_eq!(rig.sim.cores[0].in_flight().map(|b| b.len), Some(expected));
        assert!(rig.sim.cores[0].finish());
    }
    settle(&rig.device);
}

#[test]
fn late_interrupt_after_completion_is_spurious() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 1);
    rig.device.submit(&session, &submit_args(tasks.handle, 1, 0x1)).unwrap();

    rig.sim.cores[0].set_reg(pc::INT_STATUS, DONE_MASK);
    assert_eq!(rig.device.handle_irq(0), IrqOutcome::Spurious);
    assert_eq!(rig.sim.cores[0].reg(pc::INT_STATUS), 0);
    assert_eq!(rig.device.stats().spurious_irqs, 1);
    assert_eq!(rig.device.stats().jobs_completed, 1);
}

#[test]
fn invalid_submissions_are_rejected_before_touching_hardware() {
    let rig = rig(config(HwConfig {
        num_cores: 2,
        core_mask: 0x3,
        ..HwConfig::rk3588()
    }));
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 2);
    rig.sim.power.clear_events();

    let err = rig.device.submit(&session, &submit_args(tasks.handle, 0, 0x1)).unwrap_err();
    assert_eq!(err.errno(), -22);
    let err = rig.device.submit(&session, &submit_args(tasks.handle, 1, 0x4)).unwrap_err();
    assert!(matches!(err, rknpu::NpuError::InvalidCoreMask { mask: 0x4, available: 0x3 }));
    let err = rig.device.submit(&session, &submit_args(99, 1, 0x1)).unwrap_err();
    assert!(matches!(err, rknpu::NpuError::UnknownHandle(99)));
    let mut args = submit_args(tasks.handle, 1, 0x1);
    args.flags = JobFlags::empty();
    assert!(rig.device.submit(&session, &args).is_err());
    assert!(rig.sim.power.events().is_empty());

    // Range checks need the task buffer but still run before power is taken.
    let err = rig.device.submit(&session, &submit_args(tasks.handle, 300, 0x1)).unwrap_err();
    assert_eq!(err.errno(), -14);
    let err = rig.device.submit(&session, &submit_args(tasks.handle, 1, 0x3)).unwrap_err();
    assert!(matches!(err, rknpu::NpuError::InvalidArgument(_)));
    assert!(rig.sim.power.events().is_empty());
    assert!(rig.sim.cores[0].batches().is_empty());
    assert_eq!(rig.device.engine().outstanding_jobs(), 0);
}
