//! Reference-counted power management with deferred shutdown.
//!
//! The first reference powers the NPU on, the last one powers it off. Clients usually release
//! with [`PowerController::release_deferred`], which keeps the hardware up for
//! [`DeviceConfig::power_put_delay`](crate::DeviceConfig::power_put_delay) so back-to-back
//! requests do not cycle power domains. A background worker performs the delayed power-off
//! unless a new reference arrives first.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{NpuError, Result};
use crate::hw::{CoreRegs, HwError, Iommu, PowerRails};
use crate::sync::lock;
use rknpu_protocol::regs::iommu;

/// Re-establishes IOMMU translation after the NPU lost its register state.
///
/// The device-table-entry registers live in the NPU power domain and come back without their
/// valid bit. Detaching and reattaching the domain reprograms the table base; the valid bit is
/// then forced on both banks. Failures are logged only: broken translation surfaces later as a
/// job timeout.
pub(crate) fn revalidate_translation(iommu: &dyn Iommu, core0: &dyn CoreRegs) {
    iommu.detach_device();
    if let Err(err) = iommu.attach_device() {
        warn!(%err, "iommu reattach failed");
    }

    let dte0 = core0.read32(iommu::MMU0_BASE + iommu::DTE_ADDR);
    let dte1 = core0.read32(iommu::MMU1_BASE + iommu::DTE_ADDR);
    debug!(dte0, dte1, "iommu dte check");
    if dte0 != 0 && dte0 & iommu::DTE_VALID == 0 {
        core0.write32(iommu::MMU0_BASE + iommu::DTE_ADDR, dte0 | iommu::DTE_VALID);
        core0.write32(iommu::MMU1_BASE + iommu::DTE_ADDR, dte1 | iommu::DTE_VALID);
        info!(
            dte0 = core0.read32(iommu::MMU0_BASE + iommu::DTE_ADDR),
            dte1 = core0.read32(iommu::MMU1_BASE + iommu::DTE_ADDR),
            "forced iommu dte valid"
        );
    }
}

/// Physical power-on/off sequences.
pub(crate) struct PowerSequencer {
    pub rails: Arc<dyn PowerRails>,
    pub iommu: Option<Arc<dyn Iommu>>,
    pub core0: Arc<dyn CoreRegs>,
    pub iommu_settle: Duration,
}

impl PowerSequencer {
    fn power_on(&self) -> std::result::Result<(), HwError> {
        self.rails.enable_clocks()?;

        let domains = self.rails.domain_count();
        for index in 0..domains {
            if let Err(err) = self.rails.resume_domain(index) {
                warn!(domain = index, %err, "power domain resume failed");
                for resumed in (0..index).rev() {
                    self.rails.suspend_domain(resumed);
                }
                self.rails.disable_clocks();
                return Err(err);
            }
        }

        if let Err(err) = self.rails.runtime_resume() {
            warn!(%err, "npu runtime resume failed");
            for index in (0..domains).rev() {
                self.rails.suspend_domain(index);
            }
            self.rails.disable_clocks();
            return Err(err);
        }

        if let Some(iommu) = &self.iommu {
            revalidate_translation(iommu.as_ref(), self.core0.as_ref());
        }
        info!(domains, "npu powered on");
        Ok(())
    }

    fn power_off(&self) {
        self.rails.runtime_suspend();
        if self.iommu.is_some() && !self.iommu_settle.is_zero() {
            std::thread::sleep(self.iommu_settle);
        }
        for index in (0..self.rails.domain_count()).rev() {
            self.rails.suspend_domain(index);
        }
        self.rails.disable_clocks();
        info!("npu powered off");
    }
}

#[derive(Debug, Default)]
struct PowerState {
    refcount: u32,
    powered: bool,
    /// Deadline of a scheduled power-off. While set, the last reference belongs to the timer.
    off_deadline: Option<Instant>,
    /// No power-off worker; deferred releases act immediately.
    no_worker: bool,
    shutdown: bool,
}

struct PowerShared {
    state: Mutex<PowerState>,
    wake: Condvar,
    sequencer: PowerSequencer,
    put_delay: Duration,
}

impl PowerShared {
    fn acquire(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.off_deadline.take().is_some() {
            // The reference held for the pending power-off is handed to the caller.
            debug!(refcount = state.refcount, "reusing reference of pending power-off");
            return Ok(());
        }
        state.refcount += 1;
        if state.refcount == 1 {
            if let Err(err) = self.sequencer.power_on() {
                state.refcount = 0;
                return Err(NpuError::PowerOn(err));
            }
            state.powered = true;
        }
        Ok(())
    }

    fn release(&self) {
        let mut state = lock(&self.state);
        self.release_locked(&mut state);
    }

    fn release_locked(&self, state: &mut PowerState) {
        if state.refcount == 0 || state.off_deadline.is_some() {
            return;
        }
        state.refcount -= 1;
        if state.refcount == 0 && state.powered {
            self.sequencer.power_off();
            state.powered = false;
        }
    }

    fn release_deferred(&self) {
        let mut state = lock(&self.state);
        if self.put_delay.is_zero() || state.no_worker || state.shutdown {
            self.release_locked(&mut state);
            return;
        }
        match state.refcount {
            0 => {}
            1 if state.off_deadline.is_none() => {
                state.off_deadline = Some(Instant::now() + self.put_delay);
                self.wake.notify_all();
            }
            1 => {}
            _ => state.refcount -= 1,
        }
    }

    fn run_worker(&self) {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                return;
            }
            let timeout = match state.off_deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.off_deadline = None;
                        self.release_locked(&mut state);
                        continue;
                    }
                    Some(deadline - now)
                }
            };
            state = match timeout {
                None => self.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(timeout) => {
                    self.wake
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// Power reference held for as long as it lives; dropping it releases with the deferred policy.
#[must_use = "power is released as soon as the reference is dropped"]
pub struct PowerRef {
    shared: Arc<PowerShared>,
}

impl std::fmt::Debug for PowerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PowerRef")
    }
}

impl Drop for PowerRef {
    fn drop(&mut self) {
        self.shared.release_deferred();
    }
}

pub struct PowerController {
    shared: Arc<PowerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PowerController {
    pub(crate) fn new(sequencer: PowerSequencer, put_delay: Duration) -> Self {
        let shared = Arc::new(PowerShared {
            state: Mutex::new(PowerState::default()),
            wake: Condvar::new(),
            sequencer,
            put_delay,
        });
        let worker = if put_delay.is_zero() {
            None
        } else {
            let worker_shared = shared.clone();
            std::thread::Builder::new()
                .name("rknpu-power-off".into())
                .spawn(move || worker_shared.run_worker())
                .map_err(|err| warn!(%err, "power-off worker unavailable; releasing immediately"))
                .ok()
        };
        lock(&shared.state).no_worker = worker.is_none();
        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Takes a power reference, powering the NPU on if it was off.
    pub fn acquire(&self) -> Result<()> {
        self.shared.acquire()
    }

    /// Drops a reference immediately. A release with no outstanding reference is ignored.
    pub fn release(&self) {
        self.shared.release();
    }

    /// Drops a reference, deferring the power-off if it was the last one.
    pub fn release_deferred(&self) {
        self.shared.release_deferred();
    }

    /// Like [`acquire`](Self::acquire), returning a guard that releases on drop.
    pub fn acquire_ref(&self) -> Result<PowerRef> {
        self.acquire()?;
        Ok(PowerRef {
            shared: self.shared.clone(),
        })
    }

    pub fn refcount(&self) -> u32 {
        lock(&self.shared.state).refcount
    }

    pub fn is_powered(&self) -> bool {
        lock(&self.shared.state).powered
    }

    pub fn off_pending(&self) -> bool {
        lock(&self.shared.state).off_deadline.is_some()
    }

    /// Cancels any pending power-off, stops the worker and powers off if still on.
    ///
    /// References still alive afterwards release immediately.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            state.off_deadline = None;
            if state.refcount > 0 && state.powered {
                self.shared.sequencer.power_off();
                state.powered = false;
            }
            state.refcount = 0;
            self.shared.wake.notify_all();
        }
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("power-off worker panicked");
            }
        }
    }
}

impl Drop for PowerController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
