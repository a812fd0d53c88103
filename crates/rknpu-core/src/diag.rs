//! Read-only register snapshots taken when a job times out or is aborted.
//!
//! Capturing never writes to the hardware. Logging is kept separate from capture so the wait and
//! abort paths decide when a dump is emitted.

use tracing::{error, warn};

use crate::config::HwConfig;
use crate::hw::CoreRegs;
use rknpu_protocol::regs::{engine, iommu, pc};
use rknpu_protocol::RknpuTask;

/// Completed-task counter of a core.
pub(crate) fn task_counter(regs: &dyn CoreRegs, hw: &HwConfig) -> u32 {
    regs.read32(hw.pc_task_status_offset) & hw.pc_task_number_mask
}

/// Program-control state of one core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreSnapshot {
    pub core: usize,
    pub int_status: u32,
    pub raw_status: u32,
    pub task_counter: u32,
    pub data_addr: u32,
    pub data_amount: u32,
    pub task_control: u32,
    pub dma_base: u32,
}

impl CoreSnapshot {
    pub fn capture(regs: &dyn CoreRegs, hw: &HwConfig, core: usize) -> Self {
        Self {
            core,
            int_status: regs.read32(pc::INT_STATUS),
            raw_status: regs.read32(pc::INT_RAW_STATUS),
            task_counter: task_counter(regs, hw),
            data_addr: regs.read32(pc::DATA_ADDR),
            data_amount: regs.read32(pc::DATA_AMOUNT),
            task_control: regs.read32(pc::TASK_CONTROL),
            dma_base: regs.read32(pc::DMA_BASE_ADDR),
        }
    }
}

/// One IOMMU register bank, read through core 0's window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IommuBank {
    pub base: u32,
    pub dte: u32,
    pub status: u32,
    pub page_fault: u32,
    pub raw_status: u32,
    pub int_mask: u32,
}

impl IommuBank {
    pub fn capture(core0: &dyn CoreRegs, base: u32) -> Self {
        Self {
            base,
            dte: core0.read32(base + iommu::DTE_ADDR),
            status: core0.read32(base + iommu::STATUS),
            page_fault: core0.read32(base + iommu::PAGE_FAULT_ADDR),
            raw_status: core0.read32(base + iommu::INT_RAWSTAT),
            int_mask: core0.read32(base + iommu::INT_MASK),
        }
    }

    pub fn capture_all(core0: &dyn CoreRegs) -> [Self; 2] {
        iommu::BANKS.map(|base| Self::capture(core0, base))
    }
}

/// Full register dump of a core that stopped making progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutDump {
    pub core: usize,
    /// Program-control registers `0x00..=0x3c`.
    pub pc: [u32; 16],
    pub enable_mask: u32,
    /// `(block, S_STATUS, S_POINTER)` per engine block.
    pub engines: Vec<(&'static str, u32, u32)>,
    pub cna_clk_gate: u32,
}

impl TimeoutDump {
    pub fn capture(regs: &dyn CoreRegs, core: usize) -> Self {
        let mut pc_regs = [0u32; 16];
        for (index, value) in pc_regs.iter_mut().enumerate() {
            *value = regs.read32(index as u32 * 4);
        }
        Self {
            core,
            pc: pc_regs,
            enable_mask: regs.read32(pc::ENABLE_MASK),
            engines: engine::BLOCKS
                .iter()
                .map(|&(name, status, pointer)| (name, regs.read32(status), regs.read32(pointer)))
                .collect(),
            cna_clk_gate: regs.read32(engine::CNA_CLK_GATE),
        }
    }

    pub fn log(&self, tasks: &[(u32, RknpuTask)]) {
        let pc_regs = self
            .pc
            .iter()
            .enumerate()
            .map(|(index, value)| (index as u32 * 4, *value))
            .chain([(pc::ENABLE_MASK, self.enable_mask)]);
        for (reg, value) in pc_regs {
            error!(
                core = self.core,
                reg = format_args!("{reg:#06x}"),
                value = format_args!("{value:#010x}"),
                "timeout pc register"
            );
        }
        for (name, status, pointer) in &self.engines {
            error!(
                core = self.core,
                block = name,
                s_status = format_args!("{status:#010x}"),
                s_pointer = format_args!("{pointer:#010x}"),
                "timeout engine state"
            );
        }
        error!(
            core = self.core,
            cna_clk_gate = format_args!("{:#010x}", self.cna_clk_gate),
            "timeout clock gate"
        );
        for (index, task) in tasks {
            error!(
                task = index,
                flags = format_args!("{:#x}", task.flags),
                op_idx = task.op_idx,
                enable_mask = format_args!("{:#x}", task.enable_mask),
                int_mask = format_args!("{:#x}", task.int_mask),
                int_clear = format_args!("{:#x}", task.int_clear),
                int_status = format_args!("{:#x}", task.int_status),
                regcfg_amount = task.regcfg_amount,
                regcfg_offset = task.regcfg_offset,
                regcmd_addr = format_args!("{:#x}", task.regcmd_addr),
                "timeout task record"
            );
        }
    }
}

pub(crate) fn log_abort_state(cores: &[CoreSnapshot], expected: &[u32], elapsed_us: u64) {
    for (snap, mask) in cores.iter().zip(expected) {
        warn!(
            core = snap.core,
            int_status = format_args!("{:#x}", snap.int_status),
            raw_status = format_args!("{:#x}", snap.raw_status),
            expected = format_args!("{mask:#x}"),
            task_counter = snap.task_counter,
            pc_addr = format_args!("{:#x}", snap.data_addr),
            pc_amount = format_args!("{:#x}", snap.data_amount),
            task_control = format_args!("{:#x}", snap.task_control),
            dma_base = format_args!("{:#x}", snap.dma_base),
            elapsed_us,
            "aborted job core state"
        );
    }
}

pub(crate) fn log_iommu_banks(banks: &[IommuBank]) {
    for bank in banks {
        warn!(
            bank = format_args!("{:#x}", bank.base),
            dte = format_args!("{:#x}", bank.dte),
            status = format_args!("{:#x}", bank.status),
            page_fault = format_args!("{:#x}", bank.page_fault),
            raw = format_args!("{:#x}", bank.raw_status),
            mask = format_args!("{:#x}", bank.int_mask),
            "iommu state"
        );
    }
}
