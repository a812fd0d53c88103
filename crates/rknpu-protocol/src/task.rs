use bytemuck::{Pod, Zeroable};

/// One hardware task record as laid out by the user-space runtime inside a task buffer.
///
/// Layout (little-endian, no padding):
/// - 8 × `u32`: `flags`, `op_idx`, `enable_mask`, `int_mask`, `int_clear`, `int_status`,
///   `regcfg_amount`, `regcfg_offset`
/// - `regcmd_addr: u64`
///
/// Total size: 40 bytes. The driver only ever reads these records.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RknpuTask {
    pub flags: u32,
    pub op_idx: u32,
    pub enable_mask: u32,
    /// Interrupt bits the core raises once this task retires.
    pub int_mask: u32,
    pub int_clear: u32,
    pub int_status: u32,
    /// Number of register-command words in the block at `regcmd_addr`.
    pub regcfg_amount: u32,
    pub regcfg_offset: u32,
    /// Device address of the task's register-command block.
    pub regcmd_addr: u64,
}

const _: () = assert!(RknpuTask::SIZE_BYTES == 40);

impl RknpuTask {
    pub const SIZE_BYTES: usize = core::mem::size_of::<Self>();

    /// Byte offset of task `index` inside a task buffer.
    #[inline]
    pub const fn offset_of_index(index: u32) -> u64 {
        index as u64 * Self::SIZE_BYTES as u64
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; Self::SIZE_BYTES] = buf.get(..Self::SIZE_BYTES)?.try_into().ok()?;
        let u32_at = |off: usize| u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&buf[32..40]);
        Some(Self {
            flags: u32_at(0),
            op_idx: u32_at(4),
            enable_mask: u32_at(8),
            int_mask: u32_at(12),
            int_clear: u32_at(16),
            int_status: u32_at(20),
            regcfg_amount: u32_at(24),
            regcfg_offset: u32_at(28),
            regcmd_addr: u64::from_le_bytes(addr),
        })
    }

    /// View this record as raw bytes (little-endian on all supported platforms).
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
