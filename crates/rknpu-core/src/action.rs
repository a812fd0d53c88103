//! Query/set actions.

use std::sync::atomic::Ordering;

use tracing::{debug, info};

use crate::device::Device;
use crate::error::{NpuError, Result};
use rknpu_protocol::regs::{self, pc};
use rknpu_protocol::{ActionCode, DRIVER_VERSION_CODE};

impl Device {
    /// Runs action `code` with argument `value` and returns its result value.
    pub fn action(&self, code: u32, value: u32) -> Result<u32> {
        let action = ActionCode::try_from(code)
            .map_err(|err| NpuError::InvalidArgument(err.to_string()))?;
        debug!(?action, value, "action");

        use ActionCode::*;
        match action {
            GetHwVersion => Ok(self.hw_version()),
            GetDrvVersion => Ok(DRIVER_VERSION_CODE),
            GetFreq => Ok(u32::try_from(self.rails.clock_rate()).unwrap_or(u32::MAX)),
            SetFreq => {
                self.rails.set_clock_rate(value as u64)?;
                info!(hz = value, "npu clock rate set");
                Ok(0)
            }
            ActReset => self.soft_reset().map(|()| 0),
            GetIommuEn => Ok(self.iommu.is_some() as u32),
            GetTotalSramSize | GetFreeSramSize => Ok(0),
            GetIommuDomainId => Ok(self.iommu.as_ref().map_or(0, |iommu| iommu.domain_id())),
            SetIommuDomainId => {
                debug!(domain = value, "single translation domain; request ignored");
                Ok(0)
            }
            PowerOn => {
                self.power_holds.fetch_add(1, Ordering::AcqRel);
                if let Err(err) = self.power.acquire() {
                    self.power_holds.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
                Ok(0)
            }
            PowerOff => {
                let held = self
                    .power_holds
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                    .is_ok();
                if held {
                    self.power.release();
                }
                Ok(0)
            }
            ActClrTotalRwAmount | GetDtWrAmount | GetDtRdAmount | GetWtRdAmount
            | GetTotalRwAmount => Ok(0),
            GetVolt | SetVolt => Err(NpuError::Unsupported("voltage control")),
            GetBwPriority | SetBwPriority | GetBwExpect | SetBwExpect | GetBwTw | SetBwTw => {
                Err(NpuError::Unsupported("bandwidth control"))
            }
            SetProcNice => Err(NpuError::Unsupported("process priority")),
        }
    }

    /// `VERSION + (VERSION_NUM & 0xffff)` of core 0.
    pub fn hw_version(&self) -> u32 {
        let core0 = &self.cores[0];
        regs::hw_version(core0.read32(pc::VERSION), core0.read32(pc::VERSION_NUM))
    }

    /// Outstanding client power holds taken with [`ActionCode::PowerOn`].
    pub fn power_holds(&self) -> u32 {
        self.power_holds.load(Ordering::Acquire)
    }
}
