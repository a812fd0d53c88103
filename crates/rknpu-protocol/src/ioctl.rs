//! Client-facing request/response contract: job submission, buffer management and actions.

use bitflags::bitflags;
use thiserror::Error;

pub const DRIVER_MAJOR: u32 = 0;
pub const DRIVER_MINOR: u32 = 9;
pub const DRIVER_PATCHLEVEL: u32 = 8;

/// Version code reported by [`ActionCode::GetDrvVersion`].
pub const fn driver_version_code(major: u32, minor: u32, patch: u32) -> u32 {
    major * 10000 + minor * 100 + patch
}

pub const DRIVER_VERSION_CODE: u32 =
    driver_version_code(DRIVER_MAJOR, DRIVER_MINOR, DRIVER_PATCHLEVEL);

/// Maximum number of cores a device may expose.
pub const MAX_CORES: usize = 3;

/// Core-mask value requesting automatic (least-loaded) core selection.
pub const CORE_AUTO_MASK: u32 = 0x0;
pub const CORE0_MASK: u32 = 0x1;
pub const CORE1_MASK: u32 = 0x2;
pub const CORE2_MASK: u32 = 0x4;

/// Mask bit selecting `core`.
pub const fn core_mask_bit(core: usize) -> u32 {
    1 << core
}

/// Number of `subcore_task` slots in a submission.
pub const SUBCORE_TASK_SLOTS: usize = 5;

bitflags! {
    /// Submission mode flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct JobFlags: u32 {
        /// Program-counter mode: the core walks the task array itself.
        const PC = 1 << 0;
        /// Return immediately; completion is observed through the interrupt path only.
        const NONBLOCK = 1 << 1;
        const PINGPONG = 1 << 2;
        const FENCE_IN = 1 << 3;
        const FENCE_OUT = 1 << 4;
    }
}

bitflags! {
    /// Cache maintenance direction for buffer sync requests.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const TO_DEVICE = 1 << 0;
        const FROM_DEVICE = 1 << 1;
    }
}

bitflags! {
    /// Allocation hints accepted (and currently ignored) on buffer creation.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        const NON_CONTIGUOUS = 1 << 0;
        const CACHEABLE = 1 << 1;
        const WRITE_COMBINE = 1 << 2;
        const KERNEL_MAPPING = 1 << 3;
        const IOMMU = 1 << 4;
        const ZEROING = 1 << 5;
        const SECURE = 1 << 6;
        const DMA32 = 1 << 7;
        const TRY_ALLOC_SRAM = 1 << 8;
        const TRY_ALLOC_NBUF = 1 << 9;
        const IOMMU_LIMIT_IOVA_ALIGNMENT = 1 << 10;
    }
}

/// Explicit task range for one core of a manually split submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubcoreTask {
    pub task_start: u32,
    pub task_number: u32,
}

/// A job submission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitArgs {
    pub flags: JobFlags,
    /// Per-attempt wait timeout in milliseconds.
    pub timeout_ms: u32,
    pub task_start: u32,
    pub task_number: u32,
    /// Session handle of the buffer holding the task array.
    pub task_obj: u32,
    /// Device base address of the command stream; zero selects the task buffer's address.
    pub task_base_addr: u64,
    /// [`CORE_AUTO_MASK`] or a subset of the device's core mask.
    pub core_mask: u32,
    /// Per-core ranges. Jobs using one or two cores read slot `core`; jobs using three cores
    /// read slot `core + 2`. Only consulted on multi-core devices.
    pub subcore_task: [SubcoreTask; SUBCORE_TASK_SLOTS],
}

/// Outcome of a successful submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitResult {
    /// Tasks executed across all participating cores (zero for non-blocking submissions).
    pub task_counter: u32,
    /// Time between the first commit and the last core retiring, in nanoseconds.
    pub hw_elapse_time_ns: u64,
    /// Core mask the job actually ran on (resolved when automatic selection was requested).
    pub core_mask: u32,
}

/// Buffer creation request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemCreateArgs {
    pub flags: MemFlags,
    pub size: u64,
    /// Zero to allocate; otherwise a foreign buffer handle (dma-buf fd) to import.
    pub import_fd: i32,
}

/// Buffer creation response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemCreated {
    pub handle: u32,
    /// Page-aligned size actually backing the buffer.
    pub size: u64,
    pub dma_addr: u64,
    pub sram_size: u64,
}

/// Buffer cache-sync request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemSyncArgs {
    pub handle: u32,
    pub flags: SyncFlags,
}

/// One client request on an open session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Query or set value `value` for action `code` (see [`ActionCode`]).
    Action { code: u32, value: u32 },
    Submit(SubmitArgs),
    MemCreate(MemCreateArgs),
    MemMap { handle: u32 },
    MemDestroy { handle: u32 },
    MemSync(MemSyncArgs),
}

/// Successful reply to a [`Request`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Action { value: u32 },
    Submitted(SubmitResult),
    MemCreated(MemCreated),
    /// Offset to pass to `mmap` to map the buffer into the client.
    MemMapped { offset: u64 },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown action code {0}")]
pub struct UnknownAction(pub u32);

/// Action query/set codes.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionCode {
    GetHwVersion = 0,
    GetDrvVersion = 1,
    GetFreq = 2,
    SetFreq = 3,
    GetVolt = 4,
    SetVolt = 5,
    ActReset = 6,
    GetBwPriority = 7,
    SetBwPriority = 8,
    GetBwExpect = 9,
    SetBwExpect = 10,
    GetBwTw = 11,
    SetBwTw = 12,
    ActClrTotalRwAmount = 13,
    GetDtWrAmount = 14,
    GetDtRdAmount = 15,
    GetWtRdAmount = 16,
    GetTotalRwAmount = 17,
    GetIommuEn = 18,
    SetProcNice = 19,
    PowerOn = 20,
    PowerOff = 21,
    GetTotalSramSize = 22,
    GetFreeSramSize = 23,
    GetIommuDomainId = 24,
    SetIommuDomainId = 25,
}

impl TryFrom<u32> for ActionCode {
    type Error = UnknownAction;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use ActionCode::*;
        Ok(match value {
            0 => GetHwVersion,
            1 => GetDrvVersion,
            2 => GetFreq,
            3 => SetFreq,
            4 => GetVolt,
            5 => SetVolt,
            6 => ActReset,
            7 => GetBwPriority,
            8 => SetBwPriority,
            9 => GetBwExpect,
            10 => SetBwExpect,
            11 => GetBwTw,
            12 => SetBwTw,
            13 => ActClrTotalRwAmount,
            14 => GetDtWrAmount,
            15 => GetDtRdAmount,
            16 => GetWtRdAmount,
            17 => GetTotalRwAmount,
            18 => GetIommuEn,
            19 => SetProcNice,
            20 => PowerOn,
            21 => PowerOff,
            22 => GetTotalSramSize,
            23 => GetFreeSramSize,
            24 => GetIommuDomainId,
            25 => SetIommuDomainId,
            other => return Err(UnknownAction(other)),
        })
    }
}
