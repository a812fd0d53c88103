//! Scheduling core of the RKNPU driver.
//!
//! The crate owns everything between the client request surface and the register windows:
//! - [`Session`]s and their [`Buffer`]s (allocated or imported),
//! - the reference-counted [`PowerController`] with deferred power-off,
//! - the per-core queues and job state machine of the [`Engine`],
//! - guard-page mappings around a session's buffers ([`guard`]),
//! - soft reset, action dispatch and the [`Device`] tying it together.
//!
//! Hardware is reached only through the traits in [`hw`]; the attach layer that discovers the
//! device supplies them.
#![forbid(unsafe_code)]

mod action;
pub mod buffer;
pub mod config;
pub mod device;
pub mod diag;
pub mod engine;
pub mod error;
pub mod guard;
pub mod hw;
pub mod job;
pub mod power;
pub mod session;
pub mod stats;
mod sync;
mod workqueue;

#[cfg(test)]
mod testing;

pub use buffer::{Buffer, BufferKind};
pub use config::{DeviceConfig, GuardConfig, HwConfig};
pub use device::Device;
pub use engine::{least_loaded, CoreLoad, Engine, IrqOutcome, QueueSnapshot};
pub use error::{ImportStage, NpuError, Result};
pub use guard::{plan_guard_regions, GuardSet};
pub use hw::{
    AttachResources, AttachmentId, CoherentAlloc, CoreRegs, CpuMapping, DmaBuf, DmaBufExporter,
    DmaMemory, HwError, Iommu, IommuProt, PhysPage, PowerRails, ResetControl, SgEntry, SgTable,
};
pub use job::{core_range, share, CoreRange, Job};
pub use power::{PowerController, PowerRef};
pub use session::Session;
pub use stats::{NpuStats, NpuStatsSnapshot};
