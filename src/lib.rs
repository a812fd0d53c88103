//! RKNPU driver core.
//!
//! Facade over the workspace crates: [`rknpu_protocol`] carries the register map, task record and
//! request types; [`rknpu_core`] schedules jobs onto the NPU cores. Most users only need
//! [`Device`], [`Session`] and the request types re-exported here.
#![forbid(unsafe_code)]

pub use rknpu_core;
pub use rknpu_protocol;

pub use rknpu_core::{
    AttachResources, Buffer, BufferKind, CoreLoad, Device, DeviceConfig, GuardConfig, HwConfig,
    HwError, IrqOutcome, NpuError, NpuStatsSnapshot, Result, Session,
};
pub use rknpu_protocol::{
    ActionCode, JobFlags, MemCreateArgs, MemCreated, MemFlags, MemSyncArgs, Request, Response,
    RknpuTask, SubcoreTask, SubmitArgs, SubmitResult, SyncFlags,
};
