//! RKNPU hardware/ABI contract.
//!
//! This crate is the shared vocabulary between the scheduling core (`rknpu-core`), the hardware
//! model used in tests (`rknpu-sim`) and clients:
//! - [`regs`]: per-core MMIO offsets plus the fixed programming formulas,
//! - [`task`]: the 40-byte task record read out of task buffers,
//! - [`ioctl`]: submission, buffer and action request types.
#![forbid(unsafe_code)]

pub mod ioctl;
pub mod regs;
pub mod task;

pub use ioctl::{
    core_mask_bit, ActionCode, JobFlags, MemCreateArgs, MemCreated, MemFlags, MemSyncArgs,
    Request, Response, SubcoreTask, SubmitArgs, SubmitResult, SyncFlags, UnknownAction,
    CORE0_MASK, CORE1_MASK, CORE2_MASK, CORE_AUTO_MASK, DRIVER_VERSION_CODE, MAX_CORES,
    SUBCORE_TASK_SLOTS,
};
pub use task::RknpuTask;
