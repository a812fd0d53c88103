//! Hardware-visible memory objects.
//!
//! A [`Buffer`] is backed either by a coherent allocation owned by the driver or by an imported
//! foreign buffer. The backing is released when the last reference to the `Buffer` is dropped,
//! so a buffer destroyed while a job still reads from it stays alive until the job is done.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ImportStage, NpuError, Result};
use crate::hw::{
    AttachmentId, CoherentAlloc, CpuMapping, DmaBuf, DmaBufExporter, DmaMemory, HwError, SgTable,
};
use rknpu_protocol::{RknpuTask, SyncFlags};

/// Ownership model of a buffer; decides how it is synced and released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Imported,
    Allocated,
}

pub(crate) fn page_align(size: u64, page_size: u64) -> Option<u64> {
    size.checked_add(page_size - 1).map(|s| s & !(page_size - 1))
}

/// Step-by-step import of a foreign buffer.
///
/// Each step that succeeded is recorded, and dropping the chain releases exactly those steps in
/// reverse order. A failed build therefore unwinds itself, and a finished chain is released the
/// same way when its buffer goes away.
struct ImportChain {
    fd: i32,
    dmabuf: Box<dyn DmaBuf>,
    attachment: Option<AttachmentId>,
    sgt: Option<SgTable>,
    vmap: Option<Arc<dyn CpuMapping>>,
}

impl ImportChain {
    fn build(exporter: &dyn DmaBufExporter, fd: i32) -> Result<Self> {
        let fail =
            |stage: ImportStage| move |source: HwError| NpuError::Import { fd, stage, source };

        let dmabuf = exporter.get(fd).map_err(fail(ImportStage::Get))?;
        let mut chain = Self {
            fd,
            dmabuf,
            attachment: None,
            sgt: None,
            vmap: None,
        };

        let attachment = chain.dmabuf.attach().map_err(fail(ImportStage::Attach))?;
        chain.attachment = Some(attachment);

        let sgt = chain
            .dmabuf
            .map_attachment(attachment)
            .map_err(fail(ImportStage::MapAttachment))?;
        if sgt.dma_addr().is_none() {
            return Err(fail(ImportStage::MapAttachment)(HwError::Failed(
                "empty scatter-gather table".into(),
            )));
        }
        chain.sgt = Some(sgt);

        // The scheduler reads task records through the CPU, so imports must be CPU mapped too.
        let vmap = chain.dmabuf.vmap().map_err(fail(ImportStage::Vmap))?;
        chain.vmap = Some(vmap);

        Ok(chain)
    }
}

impl Drop for ImportChain {
    fn drop(&mut self) {
        if let Some(vmap) = self.vmap.take() {
            self.dmabuf.vunmap(&vmap);
        }
        if let (Some(attachment), Some(sgt)) = (self.attachment, self.sgt.take()) {
            self.dmabuf.unmap_attachment(attachment, &sgt);
        }
        if let Some(attachment) = self.attachment.take() {
            self.dmabuf.detach(attachment);
        }
        debug!(fd = self.fd, "released dma-buf import");
        // `dmabuf` drops last, releasing the handle reference.
    }
}

enum Backing {
    Allocated {
        dma: Arc<dyn DmaMemory>,
        alloc: CoherentAlloc,
    },
    Imported(ImportChain),
}

/// One memory region visible to the NPU.
pub struct Buffer {
    handle: u32,
    size: u64,
    dma_addr: u64,
    backing: Backing,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("kind", &self.kind())
            .field("size", &self.size)
            .field("dma_addr", &format_args!("{:#x}", self.dma_addr))
            .finish()
    }
}

impl Buffer {
    /// Allocates zero-filled coherent memory, rounded up to whole pages.
    pub(crate) fn allocate(
        dma: &Arc<dyn DmaMemory>,
        handle: u32,
        size: u64,
        page_size: u64,
    ) -> Result<Self> {
        let aligned = page_align(size, page_size)
            .filter(|s| *s != 0)
            .ok_or_else(|| NpuError::InvalidArgument(format!("buffer size {size:#x}")))?;
        let alloc = dma.alloc_coherent(aligned).map_err(|err| {
            warn!(size = aligned, %err, "coherent allocation failed");
            NpuError::OutOfMemory { size: aligned }
        })?;
        debug!(handle, size = aligned, dma_addr = alloc.dma_addr, "allocated buffer");
        Ok(Self {
            handle,
            size: aligned,
            dma_addr: alloc.dma_addr,
            backing: Backing::Allocated {
                dma: dma.clone(),
                alloc,
            },
        })
    }

    /// Imports the foreign buffer behind `fd`.
    ///
    /// The reported size is the requested size rounded up to whole pages, or the foreign
    /// buffer's own size when the request is zero.
    pub(crate) fn import(
        exporter: &dyn DmaBufExporter,
        handle: u32,
        fd: i32,
        size: u64,
        page_size: u64,
    ) -> Result<Self> {
        let chain = ImportChain::build(exporter, fd).map_err(|err| {
            warn!(fd, %err, "dma-buf import failed");
            err
        })?;
        let requested = if size == 0 { chain.dmabuf.size() } else { size };
        let size = page_align(requested, page_size)
            .ok_or_else(|| NpuError::InvalidArgument(format!("buffer size {size:#x}")))?;
        let sgt = chain.sgt.as_ref();
        let dma_addr = sgt.and_then(SgTable::dma_addr).unwrap_or_default();
        debug!(
            handle,
            fd,
            size,
            dma_addr,
            mapped = sgt.map(SgTable::total_len).unwrap_or_default(),
            segments = sgt.map(|t| t.entries.len()).unwrap_or_default(),
            "imported buffer"
        );
        Ok(Self {
            handle,
            size,
            dma_addr,
            backing: Backing::Imported(chain),
        })
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn dma_addr(&self) -> u64 {
        self.dma_addr
    }

    pub fn kind(&self) -> BufferKind {
        match self.backing {
            Backing::Allocated { .. } => BufferKind::Allocated,
            Backing::Imported(_) => BufferKind::Imported,
        }
    }

    /// Foreign handle this buffer was imported from.
    pub fn import_fd(&self) -> Option<i32> {
        match &self.backing {
            Backing::Imported(chain) => Some(chain.fd),
            Backing::Allocated { .. } => None,
        }
    }

    pub fn cpu(&self) -> Option<&Arc<dyn CpuMapping>> {
        match &self.backing {
            Backing::Allocated { alloc, .. } => Some(&alloc.cpu),
            Backing::Imported(chain) => chain.vmap.as_ref(),
        }
    }

    /// Device address range `[dma_addr, dma_addr + size)`.
    pub fn dma_range(&self) -> std::ops::Range<u64> {
        self.dma_addr..self.dma_addr.saturating_add(self.size)
    }

    /// Cache maintenance. Coherent allocations need none.
    pub fn sync(&self, flags: SyncFlags) {
        let Backing::Imported(chain) = &self.backing else {
            return;
        };
        let Some(sgt) = chain.sgt.as_ref() else {
            return;
        };
        if flags.contains(SyncFlags::TO_DEVICE) {
            chain.dmabuf.sync_for_device(sgt);
        }
        if flags.contains(SyncFlags::FROM_DEVICE) {
            chain.dmabuf.sync_for_cpu(sgt);
        }
    }

    /// Number of whole task records that fit in the buffer.
    pub fn task_capacity(&self) -> u64 {
        let mapped = self.cpu().map(|m| m.size()).unwrap_or(0).min(self.size);
        mapped / RknpuTask::SIZE_BYTES as u64
    }

    /// Reads task record `index` through the CPU mapping.
    pub fn read_task(&self, index: u32) -> Result<RknpuTask> {
        let cpu = self.cpu().ok_or_else(|| {
            NpuError::InvalidArgument(format!("buffer {} has no CPU mapping", self.handle))
        })?;
        let mut raw = [0u8; RknpuTask::SIZE_BYTES];
        cpu.read(RknpuTask::offset_of_index(index), &mut raw)?;
        RknpuTask::decode_from_le_bytes(&raw)
            .ok_or_else(|| NpuError::InvalidArgument(format!("task {index} truncated")))
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Backing::Allocated { dma, alloc } = &self.backing {
            dma.free_coherent(alloc);
            debug!(handle = self.handle, dma_addr = self.dma_addr, "freed buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_align_rounds_up() {
        assert_eq!(page_align(0, 4096), Some(0));
        assert_eq!(page_align(1, 4096), Some(4096));
        assert_eq!(page_align(4096, 4096), Some(4096));
        assert_eq!(page_align(4097, 4096), Some(8192));
        assert_eq!(page_align(u64::MAX, 4096), None);
    }
}
