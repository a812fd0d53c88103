use thiserror::Error;

use crate::hw::HwError;

pub type Result<T> = std::result::Result<T, NpuError>;

/// Import step that failed while building an imported buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    Get,
    Attach,
    MapAttachment,
    Vmap,
}

impl std::fmt::Display for ImportStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ImportStage::Get => "get",
            ImportStage::Attach => "attach",
            ImportStage::MapAttachment => "map attachment",
            ImportStage::Vmap => "vmap",
        })
    }
}

/// Error type for every client-visible driver operation.
///
/// Variants follow the failure taxonomy of the driver: validation errors are raised before any
/// resource is touched, resource errors are raised after partial work has been unwound, and
/// [`NpuError::Timeout`] / [`NpuError::Aborted`] are the only outcomes of a job that did not
/// complete.
#[derive(Debug, Error)]
pub enum NpuError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid core mask {mask:#x} (device supports {available:#x})")]
    InvalidCoreMask { mask: u32, available: u32 },

    #[error("submission has no tasks")]
    ZeroTaskCount,

    #[error("task range {start}..{end} on core {core} exceeds task buffer of {capacity} tasks")]
    TaskRangeOutOfBounds {
        core: usize,
        start: u64,
        end: u64,
        capacity: u64,
    },

    #[error("unknown buffer handle {0}")]
    UnknownHandle(u32),

    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: u64 },

    #[error("failed to import dma-buf fd {fd} at {stage}: {source}")]
    Import {
        fd: i32,
        stage: ImportStage,
        #[source]
        source: HwError,
    },

    #[error("failed to power on: {0}")]
    PowerOn(#[source] HwError),

    #[error(transparent)]
    Hardware(#[from] HwError),

    #[error("job timed out (hardware task counter {task_counter})")]
    Timeout { task_counter: u32 },

    #[error("job aborted")]
    Aborted,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl NpuError {
    /// Negative Linux errno the character-device surface reports for this error.
    pub fn errno(&self) -> i32 {
        const EFAULT: i32 = 14;
        const ENOMEM: i32 = 12;
        const EINVAL: i32 = 22;
        const EIO: i32 = 5;
        const ENODEV: i32 = 19;
        const ETIMEDOUT: i32 = 110;

        let errno = match self {
            NpuError::InvalidArgument(_)
            | NpuError::InvalidCoreMask { .. }
            | NpuError::ZeroTaskCount
            | NpuError::UnknownHandle(_)
            | NpuError::Unsupported(_)
            | NpuError::Aborted => EINVAL,
            NpuError::TaskRangeOutOfBounds { .. } => EFAULT,
            NpuError::OutOfMemory { .. } => ENOMEM,
            NpuError::Import { source, .. } => match source {
                HwError::NoMemory => ENOMEM,
                HwError::BadHandle(_) => EINVAL,
                _ => EIO,
            },
            NpuError::PowerOn(_) => ENODEV,
            NpuError::Hardware(_) => EIO,
            NpuError::Timeout { .. } => ETIMEDOUT,
        };
        -errno
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, NpuError::Timeout { .. })
    }
}
