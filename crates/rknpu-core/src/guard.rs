//! Guard pages around session buffers.
//!
//! The NPU prefetches past the end of command buffers. When the prefetch lands on an unmapped
//! device address the IOMMU faults and the whole job is lost, so before a submission the holes
//! between a session's buffers (and a window below the lowest one) are filled with read-only
//! mappings of one zeroed page.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::GuardConfig;
use crate::hw::{DmaMemory, Iommu, IommuProt, PhysPage};

/// Page-aligned device address ranges that should receive guard pages, in ascending order.
///
/// `buffers` may be unsorted and may overlap. The first region is the `below_pages` window
/// under the lowest buffer, present only when it fits above address zero; the rest are the
/// page-aligned holes between buffers.
pub fn plan_guard_regions(buffers: &[Range<u64>], cfg: &GuardConfig) -> Vec<Range<u64>> {
    let page = cfg.page_size;
    let mut sorted: Vec<Range<u64>> = buffers.iter().filter(|r| !r.is_empty()).cloned().collect();
    sorted.sort_by_key(|r| r.start);

    let Some(lowest) = sorted.first() else {
        return Vec::new();
    };

    let mut regions = Vec::new();
    let below = cfg.below_pages.saturating_mul(page);
    if below != 0 && lowest.start >= below {
        regions.push(lowest.start - below..lowest.start);
    }

    let mut covered_to = lowest.end;
    for next in &sorted[1..] {
        let gap_start = covered_to.checked_add(page - 1).map(|a| a & !(page - 1));
        let gap_end = next.start & !(page - 1);
        if let Some(gap_start) = gap_start {
            if gap_start < gap_end {
                regions.push(gap_start..gap_end);
            }
        }
        covered_to = covered_to.max(next.end);
    }
    regions
}

/// Guard mappings installed for one submission; dropping the set removes them.
pub struct GuardSet {
    iommu: Arc<dyn Iommu>,
    dma: Arc<dyn DmaMemory>,
    page: Option<PhysPage>,
    page_size: u64,
    mapped: Vec<u64>,
}

impl GuardSet {
    /// Maps guard pages over `regions`, stopping once `max_pages` mappings exist.
    ///
    /// Pages that fail to map (typically because the address is already in use) are skipped and
    /// do not count towards the limit. Failing to get the zero page yields an empty set.
    pub fn map(
        iommu: Arc<dyn Iommu>,
        dma: Arc<dyn DmaMemory>,
        regions: &[Range<u64>],
        cfg: &GuardConfig,
    ) -> Self {
        let mut set = Self {
            iommu,
            dma,
            page: None,
            page_size: cfg.page_size,
            mapped: Vec::new(),
        };
        if regions.is_empty() || cfg.max_pages == 0 {
            return set;
        }

        let page = match set.dma.alloc_zeroed_page() {
            Ok(page) => page,
            Err(err) => {
                warn!(%err, "no zero page for guard mappings");
                return set;
            }
        };
        set.page = Some(page);

        'regions: for (index, region) in regions.iter().enumerate() {
            let before = set.mapped.len();
            let mut iova = region.start;
            while iova < region.end {
                if set.mapped.len() >= cfg.max_pages {
                    break 'regions;
                }
                if set
                    .iommu
                    .map(iova, page.phys_addr, cfg.page_size, IommuProt::READ)
                    .is_ok()
                {
                    set.mapped.push(iova);
                }
                iova += cfg.page_size;
            }
            debug!(
                region = index,
                start = region.start,
                end = region.end,
                mapped = set.mapped.len() - before,
                pages = (region.end - region.start) / cfg.page_size,
                "guard region"
            );
        }
        debug!(pages = set.mapped.len(), regions = regions.len(), "guard pages mapped");
        set
    }

    pub fn len(&self) -> usize {
        self.mapped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapped.is_empty()
    }

    pub fn iovas(&self) -> &[u64] {
        &self.mapped
    }
}

impl std::fmt::Debug for GuardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardSet")
            .field("pages", &self.mapped.len())
            .finish_non_exhaustive()
    }
}

impl Drop for GuardSet {
    fn drop(&mut self) {
        for iova in self.mapped.drain(..) {
            self.iommu.unmap(iova, self.page_size);
        }
        if let Some(page) = self.page.take() {
            self.dma.free_page(page);
        }
    }
}
