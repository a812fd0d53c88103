//! In-process model of an RKNPU for exercising `rknpu-core` without hardware.
//!
//! [`SimNpu`] builds one implementation of every hardware trait the core consumes and hands them
//! over as [`AttachResources`]. Cores retire batches the moment they are started (unless told
//! otherwise through [`Behavior`]) and deliver their interrupts on a dispatcher thread, so the
//! driver sees the same interleavings it would see with real interrupt handlers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use rknpu_core::{
    AttachResources, Buffer, CoreRegs, DmaBufExporter, DmaMemory, Device, HwConfig, HwError,
    Iommu, PowerRails, ResetControl,
};
use rknpu_protocol::RknpuTask;

mod dmabuf;
mod memory;
mod power;
mod regfile;

pub use crate::dmabuf::{DmaBufEvent, FailAt, SimExporter, IMPORT_BASE};
pub use crate::memory::{SimDma, SimIommu, SimMemory, DMA_BASE, ZERO_PAGE_BASE};
pub use crate::power::{PowerEvent, SimPower, SimReset, DEFAULT_CLOCK_RATE};
pub use crate::regfile::{Batch, Behavior, SimCore, SIM_VERSION, SIM_VERSION_NUM};

use crate::regfile::IrqLines;

pub const PAGE_SIZE: u64 = 4096;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub hw: HwConfig,
    pub iommu: bool,
    /// Unmapped pages left between consecutive allocations.
    pub gap_pages: u64,
    pub power_domains: usize,
    pub reset_lines: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            hw: HwConfig::rk3588(),
            iommu: false,
            gap_pages: 0,
            power_domains: 3,
            reset_lines: 2,
        }
    }
}

pub struct SimNpu {
    pub cores: Vec<Arc<SimCore>>,
    pub dma: Arc<SimDma>,
    pub exporter: Arc<SimExporter>,
    pub iommu: Option<Arc<SimIommu>>,
    pub power: Arc<SimPower>,
    pub reset: Arc<SimReset>,
    irq: Arc<IrqLines>,
}

impl SimNpu {
    pub fn new(cfg: &SimConfig) -> Self {
        let irq = Arc::new(IrqLines::new());
        let cores: Vec<Arc<SimCore>> = (0..cfg.hw.num_cores)
            .map(|index| {
                Arc::new(SimCore::new(
                    index,
                    cfg.hw.pc_task_status_offset,
                    cfg.hw.pc_task_number_mask,
                    irq.clone(),
                ))
            })
            .collect();
        let iommu = match (cfg.iommu, cores.first()) {
            (true, Some(core0)) => Some(Arc::new(SimIommu::new(core0.clone()))),
            _ => None,
        };
        Self {
            dma: Arc::new(SimDma::new(iommu.clone(), cfg.gap_pages)),
            exporter: Arc::new(SimExporter::new(iommu.clone())),
            power: Arc::new(SimPower::new(cores.clone(), cfg.power_domains)),
            reset: Arc::new(SimReset::new(cores.clone(), cfg.reset_lines)),
            iommu,
            cores,
            irq,
        }
    }

    pub fn resources(&self) -> AttachResources {
        AttachResources {
            cores: self
                .cores
                .iter()
                .map(|core| core.clone() as Arc<dyn CoreRegs>)
                .collect(),
            dma: self.dma.clone() as Arc<dyn DmaMemory>,
            dmabuf: self.exporter.clone() as Arc<dyn DmaBufExporter>,
            iommu: self.iommu.clone().map(|iommu| iommu as Arc<dyn Iommu>),
            power: self.power.clone() as Arc<dyn PowerRails>,
            reset: self.reset.clone() as Arc<dyn ResetControl>,
        }
    }

    /// Routes core interrupts to `device` on a dispatcher thread.
    ///
    /// Only the first call has an effect. The thread exits once the simulator and every device
    /// holding its cores are gone.
    pub fn connect(&self, device: &Arc<Device>) -> Result<(), HwError> {
        let Some(rx) = self.irq.take_receiver() else {
            return Ok(());
        };
        let device: Weak<Device> = Arc::downgrade(device);
        std::thread::Builder::new()
            .name("rknpu-sim-irq".into())
            .spawn(move || {
                for core in rx {
                    let Some(device) = device.upgrade() else {
                        continue;
                    };
                    let outcome = device.handle_irq(core);
                    debug!(core, ?outcome, "sim irq delivered");
                }
            })
            .map(|_| ())
            .map_err(|err| HwError::Failed(format!("irq dispatcher: {err}")))
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        for core in &self.cores {
            core.set_behavior(behavior);
        }
    }
}

/// Task record raising `int_mask` on completion, with its command block at `regcmd_addr`.
pub fn task(int_mask: u32, regcmd_addr: u64) -> RknpuTask {
    RknpuTask {
        flags: 0,
        op_idx: 1,
        enable_mask: 0xd,
        int_mask,
        int_clear: 0x1ffff,
        int_status: 0,
        regcfg_amount: 108,
        regcfg_offset: 0,
        regcmd_addr,
    }
}

/// Writes `tasks` into `buffer` starting at record `start`.
pub fn write_tasks(buffer: &Buffer, start: u32, tasks: &[RknpuTask]) -> Result<(), HwError> {
    let cpu = buffer
        .cpu()
        .ok_or_else(|| HwError::Failed(format!("buffer {} has no cpu mapping", buffer.handle())))?;
    for (index, task) in (start..).zip(tasks) {
        cpu.write(RknpuTask::offset_of_index(index), task.as_bytes())?;
    }
    Ok(())
}
