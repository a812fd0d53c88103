#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use rknpu::{
    Device, DeviceConfig, HwConfig, JobFlags, MemCreateArgs, MemCreated, Session, SubmitArgs,
};
use rknpu_sim::{task, write_tasks, SimConfig, SimNpu};

/// Command blocks of test tasks start here, one 0x100 stride per task index.
pub const REGCMD_BASE: u64 = 0x2000_0000;
pub const DONE_MASK: u32 = 0x300;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct Rig {
    pub sim: SimNpu,
    pub device: Arc<Device>,
}

/// Defaults tuned for tests: immediate power-off, no settle sleeps, no load sampler.
pub fn config(hw: HwConfig) -> DeviceConfig {
    DeviceConfig {
        hw,
        power_put_delay: Duration::ZERO,
        abort_settle: Duration::ZERO,
        iommu_settle: Duration::ZERO,
        load_interval: Duration::ZERO,
        ..Default::default()
    }
}

pub fn single_core(max_submit_number: u32) -> HwConfig {
    HwConfig {
        num_cores: 1,
        core_mask: 0x1,
        max_submit_number,
        irq_names: vec!["npu_irq".into()],
        ..HwConfig::rk3588()
    }
}

pub fn rig_with(cfg: DeviceConfig, iommu: bool, gap_pages: u64) -> Rig {
    init_tracing();
    let sim = SimNpu::new(&SimConfig {
        hw: cfg.hw.clone(),
        iommu,
        gap_pages,
        ..Default::default()
    });
    let device = Device::attach(cfg, sim.resources()).expect("attach");
    sim.connect(&device).expect("irq dispatcher");
    sim.power.clear_events();
    Rig { sim, device }
}

pub fn rig(cfg: DeviceConfig) -> Rig {
    rig_with(cfg, false, 0)
}

pub fn regcmd_addr(index: u32) -> u64 {
    REGCMD_BASE + index as u64 * 0x100
}

/// Allocates a buffer holding `count` tasks that all complete with [`DONE_MASK`].
pub fn task_buffer(device: &Device, session: &Session, count: u32) -> MemCreated {
    let created = device
        .mem_create(
            session,
            &MemCreateArgs {
                size: count as u64 * rknpu::RknpuTask::SIZE_BYTES as u64,
                ..Default::default()
            },
        )
        .expect("task buffer");
    let tasks: Vec<_> = (0..count).map(|i| task(DONE_MASK, regcmd_addr(i))).collect();
    let buffer = session.get(created.handle).expect("task buffer handle");
    write_tasks(&buffer, 0, &tasks).expect("write tasks");
    created
}

pub fn submit_args(task_obj: u32, task_number: u32, core_mask: u32) -> SubmitArgs {
    SubmitArgs {
        flags: JobFlags::PC,
        timeout_ms: 2000,
        task_start: 0,
        task_number,
        task_obj,
        core_mask,
        ..Default::default()
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Waits until no job is queued or running and deferred cleanup has run.
pub fn settle(device: &Device) {
    assert!(
        wait_for(Duration::from_secs(5), || device.engine().outstanding_jobs() == 0),
        "jobs still outstanding"
    );
    device.engine().flush_cleanup();
}
