//! Hardware boundary consumed by the driver core.
//!
//! The attach/probe layer (register mapping, interrupt wiring, clock and power-domain lookup)
//! lives outside this crate. It hands the core one implementation of each trait below, bundled in
//! [`AttachResources`]. Every trait is object safe and `Send + Sync` because interrupt handlers,
//! client threads and deferred workers all touch the hardware concurrently.

use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

/// Failure reported by a hardware collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("out of memory")]
    NoMemory,

    #[error("bad handle {0}")]
    BadHandle(i32),

    #[error("address {iova:#x} is already mapped")]
    AlreadyMapped { iova: u64 },

    #[error("offset {offset:#x}+{len:#x} outside mapping of {size:#x} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("device not ready: {0}")]
    NotReady(String),

    #[error("{0}")]
    Failed(String),
}

/// 32-bit register window of one NPU core.
pub trait CoreRegs: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// CPU-visible view of a buffer.
///
/// Reads may observe device writes only after the owning buffer has been synced toward the CPU.
pub trait CpuMapping: Send + Sync {
    fn size(&self) -> u64;
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), HwError>;
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), HwError>;
}

/// Zero-filled, cache-coherent DMA allocation.
#[derive(Clone)]
pub struct CoherentAlloc {
    pub dma_addr: u64,
    pub size: u64,
    pub cpu: Arc<dyn CpuMapping>,
}

impl std::fmt::Debug for CoherentAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherentAlloc")
            .field("dma_addr", &format_args!("{:#x}", self.dma_addr))
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A single zeroed physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysPage {
    pub phys_addr: u64,
}

/// Device-side memory allocator.
pub trait DmaMemory: Send + Sync {
    /// Allocates `size` bytes (already page aligned) of zero-filled coherent memory.
    fn alloc_coherent(&self, size: u64) -> Result<CoherentAlloc, HwError>;
    fn free_coherent(&self, alloc: &CoherentAlloc);
    fn alloc_zeroed_page(&self) -> Result<PhysPage, HwError>;
    fn free_page(&self, page: PhysPage);
}

/// One contiguous device-address run of a scatter-gather table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub dma_addr: u64,
    pub len: u64,
}

/// Device mapping of an attached foreign buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SgTable {
    pub entries: Vec<SgEntry>,
}

impl SgTable {
    /// Device address of the first run; the buffer's device-visible base address.
    pub fn dma_addr(&self) -> Option<u64> {
        self.entries.first().map(|e| e.dma_addr)
    }

    pub fn total_len(&self) -> u64 {
        self.entries.iter().map(|e| e.len).sum()
    }
}

/// Opaque token for an attachment of a foreign buffer to this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentId(pub u64);

/// Resolves foreign buffer handles (dma-buf file descriptors).
pub trait DmaBufExporter: Send + Sync {
    /// Takes a reference on the buffer behind `fd`. Dropping the returned box releases it.
    fn get(&self, fd: i32) -> Result<Box<dyn DmaBuf>, HwError>;
}

/// A referenced foreign buffer.
pub trait DmaBuf: Send + Sync {
    fn size(&self) -> u64;
    fn attach(&self) -> Result<AttachmentId, HwError>;
    fn detach(&self, attachment: AttachmentId);
    fn map_attachment(&self, attachment: AttachmentId) -> Result<SgTable, HwError>;
    fn unmap_attachment(&self, attachment: AttachmentId, sgt: &SgTable);
    fn vmap(&self) -> Result<Arc<dyn CpuMapping>, HwError>;
    fn vunmap(&self, mapping: &Arc<dyn CpuMapping>);
    /// Flushes CPU caches so device reads observe prior CPU writes.
    fn sync_for_device(&self, sgt: &SgTable);
    /// Invalidates CPU caches so CPU reads observe prior device writes.
    fn sync_for_cpu(&self, sgt: &SgTable);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IommuProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// The device's IOMMU translation domain.
pub trait Iommu: Send + Sync {
    fn domain_id(&self) -> u32;
    fn map(&self, iova: u64, phys_addr: u64, size: u64, prot: IommuProt) -> Result<(), HwError>;
    /// Removes a mapping; returns the number of bytes unmapped.
    fn unmap(&self, iova: u64, size: u64) -> u64;
    fn detach_device(&self);
    fn attach_device(&self) -> Result<(), HwError>;
}

/// Clocks, power domains and runtime power management of the NPU.
pub trait PowerRails: Send + Sync {
    fn enable_clocks(&self) -> Result<(), HwError>;
    fn disable_clocks(&self);
    /// Number of per-core power domains, resumed in index order and suspended in reverse.
    fn domain_count(&self) -> usize;
    fn resume_domain(&self, index: usize) -> Result<(), HwError>;
    fn suspend_domain(&self, index: usize);
    /// Resumes the device itself and waits until it is ready to accept register accesses.
    fn runtime_resume(&self) -> Result<(), HwError>;
    fn runtime_suspend(&self);
    fn clock_rate(&self) -> u64;
    fn set_clock_rate(&self, hz: u64) -> Result<(), HwError>;
}

/// Soft-reset lines of the NPU.
pub trait ResetControl: Send + Sync {
    fn line_count(&self) -> usize;
    fn assert_line(&self, index: usize) -> Result<(), HwError>;
    fn deassert_line(&self, index: usize) -> Result<(), HwError>;
}

/// Everything the attach layer hands over when a device is brought up.
#[derive(Clone)]
pub struct AttachResources {
    /// One register window per core, in core-index order.
    pub cores: Vec<Arc<dyn CoreRegs>>,
    pub dma: Arc<dyn DmaMemory>,
    pub dmabuf: Arc<dyn DmaBufExporter>,
    /// `Some` when IOMMU translation is enabled for the device.
    pub iommu: Option<Arc<dyn Iommu>>,
    pub power: Arc<dyn PowerRails>,
    pub reset: Arc<dyn ResetControl>,
}
