use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NpuError, Result};
use rknpu_protocol::MAX_CORES;

/// Capability descriptor of one NPU variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HwConfig {
    pub num_cores: usize,
    /// Mask of cores a submission may name.
    pub core_mask: u32,
    pub pc_data_amount_scale: u32,
    pub pc_task_number_bits: u32,
    pub pc_task_number_mask: u32,
    /// Register holding the completed-task counter.
    pub pc_task_status_offset: u32,
    /// Largest batch one commit can hand to a core.
    pub max_submit_number: u32,
    /// Width of device addresses; the platform layer sets its DMA mask from it.
    pub dma_mask_bits: u32,
    /// Interrupt line of each core, in core order. The platform layer wires these to
    /// [`crate::Device::handle_irq`]; entries past `num_cores` are ignored.
    pub irq_names: Vec<String>,
}

impl HwConfig {
    /// RK3588: three cores, 12-bit task counter.
    pub fn rk3588() -> Self {
        Self {
            num_cores: 3,
            core_mask: 0x7,
            pc_data_amount_scale: 2,
            pc_task_number_bits: 12,
            pc_task_number_mask: 0xfff,
            pc_task_status_offset: 0x3c,
            max_submit_number: (1 << 12) - 1,
            dma_mask_bits: 40,
            irq_names: vec!["npu0_irq".into(), "npu1_irq".into(), "npu2_irq".into()],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_cores == 0 || self.num_cores > MAX_CORES {
            return Err(NpuError::InvalidArgument(format!(
                "core count {} outside 1..={MAX_CORES}",
                self.num_cores
            )));
        }
        let all_cores = (1u32 << self.num_cores) - 1;
        if self.core_mask == 0 || self.core_mask & !all_cores != 0 {
            return Err(NpuError::InvalidCoreMask {
                mask: self.core_mask,
                available: all_cores,
            });
        }
        if self.pc_data_amount_scale == 0 {
            return Err(NpuError::InvalidArgument(
                "pc_data_amount_scale must be non-zero".into(),
            ));
        }
        if self.max_submit_number == 0 {
            return Err(NpuError::InvalidArgument(
                "max_submit_number must be non-zero".into(),
            ));
        }
        if !(32..=64).contains(&self.dma_mask_bits) {
            return Err(NpuError::InvalidArgument(format!(
                "dma_mask_bits {} outside 32..=64",
                self.dma_mask_bits
            )));
        }
        if self.irq_names.len() < self.num_cores {
            return Err(NpuError::InvalidArgument(format!(
                "{} interrupt names for {} cores",
                self.irq_names.len(),
                self.num_cores
            )));
        }
        if self.pc_task_number_bits >= 29 {
            return Err(NpuError::InvalidArgument(format!(
                "pc_task_number_bits {} leaves no room for the control bits",
                self.pc_task_number_bits
            )));
        }
        Ok(())
    }

    pub fn is_multicore(&self) -> bool {
        self.num_cores > 1
    }
}

impl Default for HwConfig {
    fn default() -> Self {
        Self::rk3588()
    }
}

/// Guard-page placement around session buffers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Pages mapped directly below the lowest buffer.
    pub below_pages: u64,
    /// Upper bound on guard pages mapped for one submission.
    pub max_pages: usize,
    pub page_size: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            below_pages: 16,
            max_pages: 2048,
            page_size: 4096,
        }
    }
}

/// Runtime policy of a device instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub hw: HwConfig,
    /// Delay before a released device actually powers off. Zero powers off immediately.
    #[serde(with = "duration_ms")]
    pub power_put_delay: Duration,
    /// Settle time before a failed job is pulled off the queues.
    #[serde(with = "duration_ms")]
    pub abort_settle: Duration,
    /// Wait for in-flight IOMMU traffic before cutting power domains.
    #[serde(with = "duration_ms")]
    pub iommu_settle: Duration,
    /// Timed waits per blocking submission before it is declared timed out.
    pub wait_attempts: u32,
    /// Period of the load sampler. Zero disables it.
    #[serde(with = "duration_ms")]
    pub load_interval: Duration,
    pub bypass_soft_reset: bool,
    pub guard: GuardConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hw: HwConfig::default(),
            power_put_delay: Duration::from_millis(3000),
            abort_settle: Duration::from_millis(100),
            iommu_settle: Duration::from_millis(20),
            wait_attempts: 3,
            load_interval: Duration::from_secs(1),
            bypass_soft_reset: false,
            guard: GuardConfig::default(),
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        self.hw.validate()?;
        if self.wait_attempts == 0 {
            return Err(NpuError::InvalidArgument("wait_attempts must be non-zero".into()));
        }
        if !self.guard.page_size.is_power_of_two() {
            return Err(NpuError::InvalidArgument(format!(
                "guard page size {:#x} is not a power of two",
                self.guard.page_size
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
