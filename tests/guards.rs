mod common;

use std::time::Duration;

use common::*;
use pretty_assertions::assert_eq;
use rknpu::{GuardConfig, JobFlags, MemCreateArgs};
use rknpu_core::IommuProt;
use rknpu_sim::{Behavior, DMA_BASE, PAGE_SIZE, ZERO_PAGE_BASE};

/// Three one-page buffers with two unmapped pages after each.
fn spaced_rig() -> (Rig, rknpu::Session, u32) {
    let rig = rig_with(config(single_core(4095)), true, 2);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 1);
    for _ in 0..2 {
        rig.device
            .mem_create(
                &session,
                &MemCreateArgs {
                    size: PAGE_SIZE,
                    ..Default::default()
                },
            )
            .unwrap();
    }
    (rig, session, tasks.handle)
}

#[test]
fn guard_pages_fill_holes_while_a_job_runs() {
    let (rig, session, tasks) = spaced_rig();
    rig.sim.set_behavior(Behavior::Manual);
    let iommu = rig.sim.iommu.clone().unwrap();

    let mut args = submit_args(tasks, 1, 0x1);
    args.flags |= JobFlags::NONBLOCK;
    rig.device.submit(&session, &args).unwrap();

    let guards = iommu.pages_backed_by(ZERO_PAGE_BASE);
    assert_eq!(guards.len(), 16 + 2 * 2);
    assert_eq!(guards.first(), Some(&(DMA_BASE - 16 * PAGE_SIZE)));
    // Hole after the first buffer.
    assert!(guards.contains(&(DMA_BASE + PAGE_SIZE)));
    assert!(guards.contains(&(DMA_BASE + 2 * PAGE_SIZE)));
    assert_eq!(
        iommu.mapping(DMA_BASE + PAGE_SIZE),
        Some((ZERO_PAGE_BASE, IommuProt::READ))
    );
    assert_eq!(rig.device.stats().guard_pages_mapped, 20);
    assert_eq!(rig.sim.dma.live_zero_pages(), 1);

    assert!(rig.sim.cores[0].finish());
    settle(&rig.device);
    assert!(wait_for(Duration::from_secs(5), || rig.sim.dma.live_zero_pages() == 0));
    assert!(iommu.pages_backed_by(ZERO_PAGE_BASE).is_empty());
    assert!(iommu.is_mapped(DMA_BASE));
}

#[test]
fn blocking_submission_removes_guards_before_returning() {
    let (rig, session, tasks) = spaced_rig();
    let iommu = rig.sim.iommu.clone().unwrap();
    let mapped = iommu.mapped_pages();

    rig.device.submit(&session, &submit_args(tasks, 1, 0x1)).unwrap();
    assert_eq!(iommu.mapped_pages(), mapped);
    assert_eq!(rig.sim.dma.live_zero_pages(), 0);
    assert_eq!(rig.device.stats().guard_pages_mapped, 20);
}

#[test]
fn guard_pages_are_capped_per_submission() {
    let cfg = rknpu::DeviceConfig {
        guard: GuardConfig {
            max_pages: 5,
            ..Default::default()
        },
        ..config(single_core(4095))
    };
    let rig = rig_with(cfg, true, 2);
    rig.sim.set_behavior(Behavior::Manual);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 1);

    let mut args = submit_args(tasks.handle, 1, 0x1);
    args.flags |= JobFlags::NONBLOCK;
    rig.device.submit(&session, &args).unwrap();
    let iommu = rig.sim.iommu.as_ref().unwrap();
    assert_eq!(iommu.pages_backed_by(ZERO_PAGE_BASE).len(), 5);

    assert!(rig.sim.cores[0].finish());
    settle(&rig.device);
}

#[test]
fn no_guards_without_translation() {
    let rig = rig_with(config(single_core(4095)), false, 2);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 1);

    rig.device.submit(&session, &submit_args(tasks.handle, 1, 0x1)).unwrap();
    assert_eq!(rig.device.stats().guard_pages_mapped, 0);
    assert_eq!(rig.sim.dma.live_zero_pages(), 0);
}
