//! Per-core MMIO register map and the fixed hardware formulas used when programming it.
//!
//! Offsets are relative to the base of one core's register window. All registers are 32 bits
//! wide and little-endian.

/// Program-control and interrupt registers.
pub mod pc {
    pub const VERSION: u32 = 0x0000;
    pub const VERSION_NUM: u32 = 0x0004;
    /// Start strobe. Written 1 then 0 to launch the programmed batch.
    pub const OP_EN: u32 = 0x0008;
    /// Device address of the first task's register-command block.
    ///
    /// Writing `1` before programming switches the core into slave mode.
    pub const DATA_ADDR: u32 = 0x0010;
    pub const DATA_AMOUNT: u32 = 0x0014;
    pub const INT_MASK: u32 = 0x0020;
    pub const INT_CLEAR: u32 = 0x0024;
    pub const INT_STATUS: u32 = 0x0028;
    pub const INT_RAW_STATUS: u32 = 0x002c;
    pub const TASK_CONTROL: u32 = 0x0030;
    pub const DMA_BASE_ADDR: u32 = 0x0034;
    /// Last register of the program-control block (also the RK3588 task-status register).
    pub const LAST: u32 = 0x003c;

    pub const ENABLE_MASK: u32 = 0xf008;
}

/// Value written to [`pc::INT_CLEAR`] to acknowledge every interrupt source.
pub const INT_CLEAR_ALL: u32 = 0x1ffff;

/// Extra words the program-control unit fetches beyond a task's register-command amount.
pub const PC_DATA_EXTRA_AMOUNT: u32 = 4;

/// Slave-mode marker written to [`pc::DATA_ADDR`] before a batch is programmed.
pub const PC_SLAVE_MODE: u32 = 0x1;

/// Engine status/pointer register pairs, in the order they are reported in timeout dumps.
pub mod engine {
    pub const CNA_S_STATUS: u32 = 0x1000;
    pub const CNA_S_POINTER: u32 = 0x1004;
    pub const CNA_CLK_GATE: u32 = 0x1090;
    pub const CORE_S_STATUS: u32 = 0x3000;
    pub const CORE_S_POINTER: u32 = 0x3004;
    pub const DPU_S_STATUS: u32 = 0x4000;
    pub const DPU_S_POINTER: u32 = 0x4004;
    pub const RDMA_S_STATUS: u32 = 0x5000;
    pub const RDMA_S_POINTER: u32 = 0x5004;
    pub const WDMA_S_STATUS: u32 = 0x6000;
    pub const WDMA_S_POINTER: u32 = 0x6004;
    pub const WRDMA_S_STATUS: u32 = 0x7000;
    pub const WRDMA_S_POINTER: u32 = 0x7004;

    /// `(name, S_STATUS, S_POINTER)` for every engine block.
    pub const BLOCKS: [(&str, u32, u32); 6] = [
        ("CNA", CNA_S_STATUS, CNA_S_POINTER),
        ("CORE", CORE_S_STATUS, CORE_S_POINTER),
        ("DPU", DPU_S_STATUS, DPU_S_POINTER),
        ("RDMA", RDMA_S_STATUS, RDMA_S_POINTER),
        ("WDMA", WDMA_S_STATUS, WDMA_S_POINTER),
        ("WRDMA", WRDMA_S_STATUS, WRDMA_S_POINTER),
    ];

    /// Pointer registers primed with the core id on multi-core parts before each commit.
    pub const MULTICORE_PRIME: [u32; 2] = [CNA_S_POINTER, CORE_S_POINTER];
}

/// IOMMU register banks, relative to core 0's register window.
pub mod iommu {
    pub const MMU0_BASE: u32 = 0x9000;
    pub const MMU1_BASE: u32 = 0xa000;
    pub const BANKS: [u32; 2] = [MMU0_BASE, MMU1_BASE];

    pub const DTE_ADDR: u32 = 0x00;
    pub const STATUS: u32 = 0x04;
    pub const PAGE_FAULT_ADDR: u32 = 0x0c;
    pub const INT_RAWSTAT: u32 = 0x14;
    pub const INT_MASK: u32 = 0x1c;

    /// Valid bit of the device-table-entry register.
    pub const DTE_VALID: u32 = 1 << 0;
}

/// Value primed into the engine pointer registers of `core` before a multi-core commit.
pub const fn multicore_prime_value(core: usize) -> u32 {
    0xe + 0x1000_0000u32.wrapping_mul(core as u32)
}

/// `PC_DATA_AMOUNT` for a batch whose first task carries `regcfg_amount` command words.
///
/// `scale` must be non-zero.
pub const fn pc_data_amount(regcfg_amount: u32, scale: u32) -> u32 {
    (regcfg_amount + PC_DATA_EXTRA_AMOUNT + scale - 1) / scale - 1
}

/// `PC_TASK_CONTROL` word for a batch of `batch_len` tasks.
pub const fn pc_task_control(batch_len: u32, pingpong: bool, task_number_bits: u32) -> u32 {
    ((0x6 | pingpong as u32) << task_number_bits) | batch_len
}

/// Normalizes an interrupt status word into whole two-bit groups.
///
/// Each engine reports completion on a pair of adjacent status bits and may latch only one of
/// them; any set bit in a pair is widened to the full pair so the result can be compared with
/// the task's interrupt mask.
pub const fn fuzz_status(status: u32) -> u32 {
    let mut out = 0;
    let mut group = 0;
    while group < 6 {
        let bits = 0x3 << (group * 2);
        if status & bits != 0 {
            out |= bits;
        }
        group += 1;
    }
    out
}

/// Hardware version reported to clients: `VERSION + (VERSION_NUM & 0xffff)`.
pub const fn hw_version(version: u32, version_num: u32) -> u32 {
    version.wrapping_add(version_num & 0xffff)
}
