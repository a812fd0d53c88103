mod common;

use std::time::Duration;

use common::*;
use pretty_assertions::assert_eq;
use rknpu::{
    BufferKind, JobFlags, MemCreateArgs, MemSyncArgs, NpuError, Request, Response, SyncFlags,
};
use rknpu_sim::{Behavior, DmaBufEvent::*, FailAt, DMA_BASE};

fn alloc(size: u64) -> MemCreateArgs {
    MemCreateArgs {
        size,
        ..Default::default()
    }
}

fn import(fd: i32, size: u64) -> MemCreateArgs {
    MemCreateArgs {
        size,
        import_fd: fd,
        ..Default::default()
    }
}

#[test]
fn allocation_is_page_rounded_and_mappable() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();

    let created = rig.device.mem_create(&session, &alloc(100)).unwrap();
    assert_eq!(created.handle, 1);
    assert_eq!(created.size, 4096);
    assert_eq!(created.dma_addr, DMA_BASE);
    assert_eq!(created.sram_size, 0);

    let offset = rig.device.mem_map(&session, created.handle).unwrap();
    assert_eq!(offset, created.dma_addr);
    let target = rig.device.mmap_target(&session, offset, 4096).unwrap();
    assert_eq!(target.handle(), created.handle);
    assert_eq!(target.kind(), BufferKind::Allocated);
    assert!(rig.device.mmap_target(&session, offset, 8192).is_err());
    assert!(rig.device.mmap_target(&session, offset + 4096, 1).is_err());
}

#[test]
fn handles_are_per_session() {
    let rig = rig(config(single_core(4095)));
    let first = rig.device.open();
    let second = rig.device.open();

    let a = rig.device.mem_create(&first, &alloc(4096)).unwrap();
    let b = rig.device.mem_create(&second, &alloc(4096)).unwrap();
    assert_eq!((a.handle, b.handle), (1, 1));
    assert_ne!(a.dma_addr, b.dma_addr);
    assert!(matches!(
        rig.device.mem_map(&first, 2),
        Err(NpuError::UnknownHandle(2))
    ));
}

#[test]
fn destroy_frees_the_allocation_once() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();
    let created = rig.device.mem_create(&session, &alloc(8192)).unwrap();
    assert_eq!(rig.sim.dma.live_allocations(), 1);
    assert!(session.maps_dma_addr(created.dma_addr));

    rig.device.mem_destroy(&session, created.handle).unwrap();
    assert_eq!(rig.sim.dma.live_allocations(), 0);
    assert!(!session.maps_dma_addr(created.dma_addr));
    let err = rig.device.mem_destroy(&session, created.handle).unwrap_err();
    assert!(matches!(err, NpuError::UnknownHandle(h) if h == created.handle));
    assert_eq!(err.errno(), -22);
}

#[test]
fn failed_allocation_reports_out_of_memory() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();
    rig.sim.dma.set_fail_alloc(true);

    let err = rig.device.mem_create(&session, &alloc(4096)).unwrap_err();
    assert!(matches!(err, NpuError::OutOfMemory { size: 4096 }));
    assert_eq!(err.errno(), -12);
    assert_eq!(session.buffer_count(), 0);
}

#[test]
fn import_acquires_every_stage_and_releases_in_reverse() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();
    let fd = rig.sim.exporter.export(10_000);

    let created = rig.device.mem_create(&session, &import(fd, 0)).unwrap();
    assert_eq!(created.size, 12_288);
    assert_eq!(created.dma_addr, rknpu_sim::IMPORT_BASE);
    assert_eq!(rig.sim.exporter.events(), vec![Get(fd), Attach(fd), Map(fd), Vmap(fd)]);
    let buffer = session.get(created.handle).unwrap();
    assert_eq!(buffer.kind(), BufferKind::Imported);
    assert_eq!(buffer.import_fd(), Some(fd));
    drop(buffer);

    assert!(session.maps_dma_addr(created.dma_addr));

    rig.sim.exporter.clear_events();
    rig.device.mem_destroy(&session, created.handle).unwrap();
    assert_eq!(
        rig.sim.exporter.events(),
        vec![Vunmap(fd), Unmap(fd), Detach(fd), Put(fd)]
    );
    assert!(!session.maps_dma_addr(created.dma_addr));
}

#[test]
fn failed_import_unwinds_completed_stages() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();
    let fd = rig.sim.exporter.export(4096);
    rig.sim.exporter.fail_at(Some(FailAt::Vmap));

    let err = rig.device.mem_create(&session, &import(fd, 4096)).unwrap_err();
    assert!(matches!(err, NpuError::Import { fd: f, .. } if f == fd));
    assert_eq!(
        rig.sim.exporter.events(),
        vec![Get(fd), Attach(fd), Map(fd), Unmap(fd), Detach(fd), Put(fd)]
    );
    assert_eq!(session.buffer_count(), 0);

    rig.sim.exporter.clear_events();
    rig.sim.exporter.fail_at(None);
    let err = rig.device.mem_create(&session, &import(99, 4096)).unwrap_err();
    assert_eq!(err.errno(), -22);
    assert!(rig.sim.exporter.events().is_empty());
}

#[test]
fn explicit_sync_reaches_the_exporter() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();
    let fd = rig.sim.exporter.export(4096);
    let created = rig.device.mem_create(&session, &import(fd, 4096)).unwrap();
    rig.sim.exporter.clear_events();

    rig.device
        .mem_sync(
            &session,
            &MemSyncArgs {
                handle: created.handle,
                flags: SyncFlags::TO_DEVICE | SyncFlags::FROM_DEVICE,
            },
        )
        .unwrap();
    assert_eq!(rig.sim.exporter.events(), vec![SyncForDevice(fd), SyncForCpu(fd)]);
}

#[test]
fn submission_syncs_imports_around_the_job() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 1);
    let fd = rig.sim.exporter.export(4096);
    rig.device.mem_create(&session, &import(fd, 4096)).unwrap();
    rig.sim.exporter.clear_events();

    rig.device.submit(&session, &submit_args(tasks.handle, 1, 0x1)).unwrap();
    assert_eq!(rig.sim.exporter.events(), vec![SyncForDevice(fd), SyncForCpu(fd)]);
}

#[test]
fn closing_a_session_releases_its_buffers() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();
    for size in [4096, 8192, 100] {
        rig.device.mem_create(&session, &alloc(size)).unwrap();
    }
    let fd = rig.sim.exporter.export(4096);
    rig.device.mem_create(&session, &import(fd, 4096)).unwrap();
    assert_eq!(rig.sim.dma.live_allocations(), 3);

    rig.device.close(session);
    assert_eq!(rig.sim.dma.live_allocations(), 0);
    assert_eq!(rig.sim.exporter.events().last(), Some(&Put(fd)));
}

#[test]
fn buffer_outlives_destroy_while_a_job_uses_it() {
    let rig = rig(config(single_core(4095)));
    rig.sim.set_behavior(Behavior::Manual);
    let session = rig.device.open();
    let tasks = task_buffer(&rig.device, &session, 1);

    let mut args = submit_args(tasks.handle, 1, 0x1);
    args.flags |= JobFlags::NONBLOCK;
    rig.device.submit(&session, &args).unwrap();
    rig.device.mem_destroy(&session, tasks.handle).unwrap();
    assert_eq!(rig.sim.dma.live_allocations(), 1);
    assert_eq!(session.buffer_count(), 0);

    assert!(rig.sim.cores[0].finish());
    settle(&rig.device);
    assert!(wait_for(Duration::from_secs(5), || rig.sim.dma.live_allocations() == 0));
}

#[test]
fn requests_round_trip_through_ioctl() {
    let rig = rig(config(single_core(4095)));
    let session = rig.device.open();

    let Response::MemCreated(created) = rig
        .device
        .ioctl(&session, Request::MemCreate(alloc(4096)))
        .unwrap()
    else {
        panic!("expected MemCreated");
    };
    assert_eq!(
        rig.device
            .ioctl(&session, Request::MemMap { handle: created.handle })
            .unwrap(),
        Response::MemMapped { offset: created.dma_addr }
    );
    assert_eq!(
        rig.device
            .ioctl(&session, Request::MemDestroy { handle: created.handle })
            .unwrap(),
        Response::Done
    );
    // Every request holds power while it runs.
    assert_eq!(rig.sim.power.power_ons(), 3);
    assert!(rig.sim.power.is_off());
}
