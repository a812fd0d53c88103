//! In-process fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::hw::{CoherentAlloc, CoreRegs, CpuMapping, DmaMemory, HwError, PhysPage};
use rknpu_protocol::regs::pc;
use rknpu_protocol::RknpuTask;

/// Register file that remembers every write.
#[derive(Default)]
pub struct FakeRegs {
    values: Mutex<HashMap<u32, u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
}

impl FakeRegs {
    pub fn set(&self, offset: u32, value: u32) {
        self.values.lock().unwrap().insert(offset, value);
    }

    pub fn get(&self, offset: u32) -> u32 {
        self.read32(offset)
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.writes.lock().unwrap().clone()
    }

    /// Batch length of every started commit, in order.
    pub fn batch_lengths(&self) -> Vec<u32> {
        let mut task_control = 0;
        let mut out = Vec::new();
        for (offset, value) in self.writes() {
            match offset {
                pc::TASK_CONTROL => task_control = value,
                pc::OP_EN if value == 1 => out.push(task_control & 0xfff),
                _ => {}
            }
        }
        out
    }
}

impl CoreRegs for FakeRegs {
    fn read32(&self, offset: u32) -> u32 {
        self.values.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.writes.lock().unwrap().push((offset, value));
        self.values.lock().unwrap().insert(offset, value);
    }
}

pub struct VecMapping(Mutex<Vec<u8>>);

impl VecMapping {
    pub fn new(size: u64) -> Self {
        Self(Mutex::new(vec![0; size as usize]))
    }
}

impl CpuMapping for VecMapping {
    fn size(&self) -> u64 {
        self.0.lock().unwrap().len() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), HwError> {
        let data = self.0.lock().unwrap();
        let start = offset as usize;
        let src = data.get(start..start + buf.len()).ok_or(HwError::OutOfBounds {
            offset,
            len: buf.len() as u64,
            size: data.len() as u64,
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<(), HwError> {
        let mut data = self.0.lock().unwrap();
        let size = data.len() as u64;
        let start = offset as usize;
        let dst = data.get_mut(start..start + src.len()).ok_or(HwError::OutOfBounds {
            offset,
            len: src.len() as u64,
            size,
        })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// Bump allocator handing out device addresses from 1 MiB upwards.
pub struct FakeDma {
    next: AtomicU64,
    pub freed: AtomicUsize,
}

impl Default for FakeDma {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(0x10_0000),
            freed: AtomicUsize::new(0),
        }
    }
}

impl DmaMemory for FakeDma {
    fn alloc_coherent(&self, size: u64) -> Result<CoherentAlloc, HwError> {
        let dma_addr = self.next.fetch_add(size, Ordering::SeqCst);
        Ok(CoherentAlloc {
            dma_addr,
            size,
            cpu: Arc::new(VecMapping::new(size)),
        })
    }

    fn free_coherent(&self, _alloc: &CoherentAlloc) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }

    fn alloc_zeroed_page(&self) -> Result<PhysPage, HwError> {
        Ok(PhysPage { phys_addr: 0x8000_0000 })
    }

    fn free_page(&self, _page: PhysPage) {}
}

pub fn task(int_mask: u32) -> RknpuTask {
    RknpuTask {
        flags: 0,
        op_idx: 1,
        enable_mask: 0xd,
        int_mask,
        int_clear: 0x1ffff,
        int_status: 0,
        regcfg_amount: 8,
        regcfg_offset: 0,
        regcmd_addr: 0x20_0000,
    }
}

/// Allocated buffer holding `tasks` from index 0.
pub fn task_buffer(dma: &Arc<FakeDma>, tasks: &[RknpuTask]) -> Arc<Buffer> {
    let dma: Arc<dyn DmaMemory> = dma.clone();
    let size = (tasks.len().max(1) * RknpuTask::SIZE_BYTES) as u64;
    let buffer = Buffer::allocate(&dma, 1, size, 4096).unwrap();
    let cpu = buffer.cpu().unwrap();
    for (index, task) in tasks.iter().enumerate() {
        cpu.write(RknpuTask::offset_of_index(index as u32), task.as_bytes())
            .unwrap();
    }
    Arc::new(buffer)
}
