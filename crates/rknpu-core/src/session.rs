use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::buffer::{Buffer, BufferKind};
use crate::error::{NpuError, Result};
use crate::sync::lock;

/// One client connection and the buffers it owns.
///
/// The session's buffer list is the authority on whether a buffer still exists: handles are
/// resolved only through it, and removing an entry is what destroys a buffer. Dropping the
/// session releases every buffer still listed.
#[derive(Debug)]
pub struct Session {
    id: u64,
    next_handle: AtomicU32,
    buffers: Mutex<Vec<Arc<Buffer>>>,
}

impl Session {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            next_handle: AtomicU32::new(1),
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn allocate_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, buffer: Buffer) -> Arc<Buffer> {
        let buffer = Arc::new(buffer);
        lock(&self.buffers).push(buffer.clone());
        buffer
    }

    /// Unlinks the buffer; its memory is released once no job references it any more.
    pub(crate) fn remove(&self, handle: u32) -> Result<Arc<Buffer>> {
        let mut buffers = lock(&self.buffers);
        let index = buffers
            .iter()
            .position(|b| b.handle() == handle)
            .ok_or(NpuError::UnknownHandle(handle))?;
        Ok(buffers.remove(index))
    }

    pub fn get(&self, handle: u32) -> Result<Arc<Buffer>> {
        lock(&self.buffers)
            .iter()
            .find(|b| b.handle() == handle)
            .cloned()
            .ok_or(NpuError::UnknownHandle(handle))
    }

    /// Current buffers, in creation order.
    pub fn buffers(&self) -> Vec<Arc<Buffer>> {
        lock(&self.buffers).clone()
    }

    pub(crate) fn imported_buffers(&self) -> Vec<Arc<Buffer>> {
        lock(&self.buffers)
            .iter()
            .filter(|b| b.kind() == BufferKind::Imported)
            .cloned()
            .collect()
    }

    pub fn buffer_count(&self) -> usize {
        lock(&self.buffers).len()
    }

    /// Whether any buffer of this session covers device address `addr`.
    pub fn maps_dma_addr(&self, addr: u64) -> bool {
        lock(&self.buffers)
            .iter()
            .any(|b| b.dma_range().contains(&addr))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let leaked = std::mem::take(&mut *lock(&self.buffers));
        for buffer in &leaked {
            debug!(
                session = self.id,
                handle = buffer.handle(),
                dma_addr = buffer.dma_addr(),
                size = buffer.size(),
                kind = ?buffer.kind(),
                "releasing buffer left open at session close"
            );
        }
    }
}
