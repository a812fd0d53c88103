//! Foreign buffers another driver exported, addressed by file descriptor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::memory::{SimIommu, SimMemory};
use crate::{lock, PAGE_SIZE};
use rknpu_core::{
    AttachmentId, CpuMapping, DmaBuf, DmaBufExporter, HwError, Iommu, IommuProt, SgEntry, SgTable,
};

/// Base of the device addresses imported buffers are mapped at.
pub const IMPORT_BASE: u64 = 0x4000_0000;

/// Import step at which the exporter can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Get,
    Attach,
    Map,
    Vmap,
}

/// One call the driver made on a foreign buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaBufEvent {
    Get(i32),
    Attach(i32),
    Map(i32),
    Vmap(i32),
    Vunmap(i32),
    Unmap(i32),
    Detach(i32),
    Put(i32),
    SyncForDevice(i32),
    SyncForCpu(i32),
}

struct Exported {
    size: u64,
    dma_addr: u64,
    memory: Arc<SimMemory>,
}

#[derive(Default)]
struct Shared {
    buffers: Mutex<HashMap<i32, Arc<Exported>>>,
    events: Mutex<Vec<DmaBufEvent>>,
    fail_at: Mutex<Option<FailAt>>,
    next_attachment: AtomicU64,
}

impl Shared {
    fn log(&self, event: DmaBufEvent) {
        lock(&self.events).push(event);
    }

    fn check(&self, step: FailAt, fd: i32) -> Result<(), HwError> {
        if *lock(&self.fail_at) == Some(step) {
            return Err(HwError::Failed(format!("injected {step:?} failure on fd {fd}")));
        }
        Ok(())
    }
}

pub struct SimExporter {
    shared: Arc<Shared>,
    iommu: Option<Arc<SimIommu>>,
    next_fd: AtomicI32,
    next_addr: AtomicU64,
}

impl SimExporter {
    pub(crate) fn new(iommu: Option<Arc<SimIommu>>) -> Self {
        Self {
            shared: Arc::default(),
            iommu,
            next_fd: AtomicI32::new(10),
            next_addr: AtomicU64::new(IMPORT_BASE),
        }
    }

    /// Creates a foreign buffer of `size` bytes and returns its descriptor.
    pub fn export(&self, size: u64) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let dma_addr = self.next_addr.fetch_add(size + PAGE_SIZE, Ordering::SeqCst);
        lock(&self.shared.buffers).insert(
            fd,
            Arc::new(Exported {
                size,
                dma_addr,
                memory: Arc::new(SimMemory::new(size)),
            }),
        );
        fd
    }

    /// CPU view of the exporter's own copy of buffer `fd`.
    pub fn memory(&self, fd: i32) -> Option<Arc<dyn CpuMapping>> {
        lock(&self.shared.buffers)
            .get(&fd)
            .map(|b| b.memory.clone() as Arc<dyn CpuMapping>)
    }

    pub fn fail_at(&self, step: Option<FailAt>) {
        *lock(&self.shared.fail_at) = step;
    }

    pub fn events(&self) -> Vec<DmaBufEvent> {
        lock(&self.shared.events).clone()
    }

    pub fn clear_events(&self) {
        lock(&self.shared.events).clear();
    }
}

impl DmaBufExporter for SimExporter {
    fn get(&self, fd: i32) -> Result<Box<dyn DmaBuf>, HwError> {
        self.shared.check(FailAt::Get, fd)?;
        let exported = lock(&self.shared.buffers)
            .get(&fd)
            .cloned()
            .ok_or(HwError::BadHandle(fd))?;
        self.shared.log(DmaBufEvent::Get(fd));
        Ok(Box::new(SimDmaBuf {
            fd,
            exported,
            shared: self.shared.clone(),
            iommu: self.iommu.clone(),
        }))
    }
}

struct SimDmaBuf {
    fd: i32,
    exported: Arc<Exported>,
    shared: Arc<Shared>,
    iommu: Option<Arc<SimIommu>>,
}

impl DmaBuf for SimDmaBuf {
    fn size(&self) -> u64 {
        self.exported.size
    }

    fn attach(&self) -> Result<AttachmentId, HwError> {
        self.shared.check(FailAt::Attach, self.fd)?;
        self.shared.log(DmaBufEvent::Attach(self.fd));
        Ok(AttachmentId(
            self.shared.next_attachment.fetch_add(1, Ordering::SeqCst),
        ))
    }

    fn detach(&self, _attachment: AttachmentId) {
        self.shared.log(DmaBufEvent::Detach(self.fd));
    }

    fn map_attachment(&self, _attachment: AttachmentId) -> Result<SgTable, HwError> {
        self.shared.check(FailAt::Map, self.fd)?;
        let Exported { size, dma_addr, .. } = *self.exported;
        if let Some(iommu) = &self.iommu {
            iommu.map(dma_addr, dma_addr, size, IommuProt::READ | IommuProt::WRITE)?;
        }
        self.shared.log(DmaBufEvent::Map(self.fd));
        Ok(SgTable {
            entries: vec![SgEntry {
                dma_addr,
                len: size,
            }],
        })
    }

    fn unmap_attachment(&self, _attachment: AttachmentId, sgt: &SgTable) {
        if let Some(iommu) = &self.iommu {
            for entry in &sgt.entries {
                iommu.unmap(entry.dma_addr, entry.len);
            }
        }
        self.shared.log(DmaBufEvent::Unmap(self.fd));
    }

    fn vmap(&self) -> Result<Arc<dyn CpuMapping>, HwError> {
        self.shared.check(FailAt::Vmap, self.fd)?;
        self.shared.log(DmaBufEvent::Vmap(self.fd));
        Ok(self.exported.memory.clone())
    }

    fn vunmap(&self, _mapping: &Arc<dyn CpuMapping>) {
        self.shared.log(DmaBufEvent::Vunmap(self.fd));
    }

    fn sync_for_device(&self, _sgt: &SgTable) {
        self.shared.log(DmaBufEvent::SyncForDevice(self.fd));
    }

    fn sync_for_cpu(&self, _sgt: &SgTable) {
        self.shared.log(DmaBufEvent::SyncForCpu(self.fd));
    }
}

impl Drop for SimDmaBuf {
    fn drop(&mut self) {
        self.shared.log(DmaBufEvent::Put(self.fd));
    }
}
