//! Device memory: coherent allocations and the IOMMU domain they are mapped through.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::regfile::SimCore;
use crate::{lock, PAGE_SIZE};
use rknpu_core::{CoherentAlloc, CpuMapping, DmaMemory, HwError, Iommu, IommuProt, PhysPage};
use rknpu_protocol::regs::iommu;

/// Byte-addressable backing store shared by the CPU and device views of a buffer.
pub struct SimMemory(Mutex<Vec<u8>>);

impl SimMemory {
    pub fn new(size: u64) -> Self {
        Self(Mutex::new(vec![0; size as usize]))
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>, HwError> {
        let size = self.size();
        let end = offset.checked_add(len as u64).filter(|end| *end <= size);
        match end {
            Some(end) => Ok(offset as usize..end as usize),
            None => Err(HwError::OutOfBounds {
                offset,
                len: len as u64,
                size,
            }),
        }
    }
}

impl CpuMapping for SimMemory {
    fn size(&self) -> u64 {
        lock(&self.0).len() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), HwError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&lock(&self.0)[range]);
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), HwError> {
        let range = self.range(offset, data.len())?;
        lock(&self.0)[range].copy_from_slice(data);
        Ok(())
    }
}

#[derive(Default)]
struct IommuState {
    /// Page-granular mappings keyed by IOVA.
    pages: BTreeMap<u64, (u64, IommuProt)>,
    attached: bool,
    attaches: usize,
    detaches: usize,
}

/// Translation domain of the NPU.
///
/// Attaching the device programs the table base into both DTE registers of core 0 without the
/// valid bit, the way the real hardware comes back after a power cycle.
pub struct SimIommu {
    domain_id: u32,
    table_base: u32,
    core0: Arc<SimCore>,
    state: Mutex<IommuState>,
    fail_attach: AtomicBool,
}

impl SimIommu {
    pub(crate) fn new(core0: Arc<SimCore>) -> Self {
        let iommu = Self {
            domain_id: 0,
            table_base: 0x0100_0000,
            core0,
            state: Mutex::new(IommuState::default()),
            fail_attach: AtomicBool::new(false),
        };
        iommu.program_dte();
        lock(&iommu.state).attached = true;
        iommu
    }

    fn program_dte(&self) {
        for bank in iommu::BANKS {
            self.core0.set_reg(bank + iommu::DTE_ADDR, self.table_base);
        }
    }

    pub fn set_fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    pub fn mapping(&self, iova: u64) -> Option<(u64, IommuProt)> {
        lock(&self.state).pages.get(&(iova & !(PAGE_SIZE - 1))).copied()
    }

    pub fn is_mapped(&self, iova: u64) -> bool {
        self.mapping(iova).is_some()
    }

    pub fn mapped_pages(&self) -> usize {
        lock(&self.state).pages.len()
    }

    /// IOVAs of every page mapped to `phys_addr`.
    pub fn pages_backed_by(&self, phys_addr: u64) -> Vec<u64> {
        lock(&self.state)
            .pages
            .iter()
            .filter(|(_, (phys, _))| *phys == phys_addr)
            .map(|(iova, _)| *iova)
            .collect()
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.state).attached
    }

    /// `(attaches, detaches)` performed by the driver.
    pub fn attach_counts(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.attaches, state.detaches)
    }
}

impl Iommu for SimIommu {
    fn domain_id(&self) -> u32 {
        self.domain_id
    }

    fn map(&self, iova: u64, phys_addr: u64, size: u64, prot: IommuProt) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        let pages = size.div_ceil(PAGE_SIZE);
        let iovas = (0..pages).map(|page| iova + page * PAGE_SIZE);
        if let Some(taken) = iovas.clone().find(|iova| state.pages.contains_key(iova)) {
            return Err(HwError::AlreadyMapped { iova: taken });
        }
        for (page, iova) in iovas.enumerate() {
            state
                .pages
                .insert(iova, (phys_addr + page as u64 * PAGE_SIZE, prot));
        }
        Ok(())
    }

    fn unmap(&self, iova: u64, size: u64) -> u64 {
        let mut state = lock(&self.state);
        let pages = size.div_ceil(PAGE_SIZE);
        let removed = (0..pages)
            .filter(|page| state.pages.remove(&(iova + page * PAGE_SIZE)).is_some())
            .count() as u64;
        removed * PAGE_SIZE
    }

    fn detach_device(&self) {
        let mut state = lock(&self.state);
        state.attached = false;
        state.detaches += 1;
    }

    fn attach_device(&self) -> Result<(), HwError> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(HwError::NotReady("iommu attach".into()));
        }
        {
            let mut state = lock(&self.state);
            state.attached = true;
            state.attaches += 1;
        }
        self.program_dte();
        Ok(())
    }
}

/// Bump allocator over device address space.
///
/// With an IOMMU, every allocation is also mapped read/write through it so that guard pages
/// cannot land on top of live buffers.
pub struct SimDma {
    next: AtomicU64,
    gap: u64,
    iommu: Option<Arc<SimIommu>>,
    live: AtomicUsize,
    zero_pages: AtomicUsize,
    fail_alloc: AtomicBool,
    next_page: AtomicU64,
}

pub const DMA_BASE: u64 = 0x1000_0000;
pub const ZERO_PAGE_BASE: u64 = 0xf000_0000;

impl SimDma {
    pub(crate) fn new(iommu: Option<Arc<SimIommu>>, gap_pages: u64) -> Self {
        Self {
            next: AtomicU64::new(DMA_BASE),
            gap: gap_pages * PAGE_SIZE,
            iommu,
            live: AtomicUsize::new(0),
            zero_pages: AtomicUsize::new(0),
            fail_alloc: AtomicBool::new(false),
            next_page: AtomicU64::new(ZERO_PAGE_BASE),
        }
    }

    pub fn set_fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    /// Coherent allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Zero pages handed out and not yet freed.
    pub fn live_zero_pages(&self) -> usize {
        self.zero_pages.load(Ordering::SeqCst)
    }
}

impl DmaMemory for SimDma {
    fn alloc_coherent(&self, size: u64) -> Result<CoherentAlloc, HwError> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return Err(HwError::NoMemory);
        }
        let dma_addr = self.next.fetch_add(size + self.gap, Ordering::SeqCst);
        if let Some(iommu) = &self.iommu {
            iommu.map(dma_addr, dma_addr, size, IommuProt::READ | IommuProt::WRITE)?;
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(CoherentAlloc {
            dma_addr,
            size,
            cpu: Arc::new(SimMemory::new(size)),
        })
    }

    fn free_coherent(&self, alloc: &CoherentAlloc) {
        if let Some(iommu) = &self.iommu {
            iommu.unmap(alloc.dma_addr, alloc.size);
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn alloc_zeroed_page(&self) -> Result<PhysPage, HwError> {
        self.zero_pages.fetch_add(1, Ordering::SeqCst);
        Ok(PhysPage {
            phys_addr: self.next_page.fetch_add(PAGE_SIZE, Ordering::SeqCst),
        })
    }

    fn free_page(&self, _page: PhysPage) {
        self.zero_pages.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regfile::IrqLines;

    fn iommu() -> SimIommu {
        SimIommu::new(Arc::new(SimCore::new(0, 0x3c, 0xfff, Arc::new(IrqLines::new()))))
    }

    #[test]
    fn overlapping_map_is_rejected() {
        let iommu = iommu();
        iommu.map(0x1000, 0x8000, 0x2000, IommuProt::READ).unwrap();
        assert_eq!(
            iommu.map(0x2000, 0x9000, 0x1000, IommuProt::READ),
            Err(HwError::AlreadyMapped { iova: 0x2000 })
        );
        assert_eq!(iommu.mapping(0x2004), Some((0x9000, IommuProt::READ)));
        assert_eq!(iommu.unmap(0x1000, 0x3000), 0x2000);
        assert_eq!(iommu.mapped_pages(), 0);
    }

    #[test]
    fn allocations_are_mapped_and_spaced() {
        let iommu = Arc::new(iommu());
        let dma = SimDma::new(Some(iommu.clone()), 2);
        let a = dma.alloc_coherent(PAGE_SIZE).unwrap();
        let b = dma.alloc_coherent(PAGE_SIZE).unwrap();
        assert_eq!(b.dma_addr - a.dma_addr, 3 * PAGE_SIZE);
        assert!(iommu.is_mapped(a.dma_addr));
        dma.free_coherent(&a);
        assert!(!iommu.is_mapped(a.dma_addr));
        assert_eq!(dma.live_allocations(), 1);
    }
}
