use std::sync::{Arc, Mutex};

use crate::lock;
use crate::regfile::SimCore;
use rknpu_core::{HwError, PowerRails, ResetControl};

/// One call the driver made on the power rails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    ClocksOn,
    ClocksOff,
    DomainOn(usize),
    DomainOff(usize),
    Resume,
    Suspend,
}

struct RailState {
    events: Vec<PowerEvent>,
    clocks: bool,
    domains: Vec<bool>,
    active: bool,
    rate: u64,
    fail_domain: Option<usize>,
}

pub struct SimPower {
    cores: Vec<Arc<SimCore>>,
    state: Mutex<RailState>,
}

pub const DEFAULT_CLOCK_RATE: u64 = 1_000_000_000;

impl SimPower {
    pub(crate) fn new(cores: Vec<Arc<SimCore>>, domains: usize) -> Self {
        Self {
            cores,
            state: Mutex::new(RailState {
                events: Vec::new(),
                clocks: false,
                domains: vec![false; domains],
                active: false,
                rate: DEFAULT_CLOCK_RATE,
                fail_domain: None,
            }),
        }
    }

    /// Whether clocks, every domain and the device itself are up.
    pub fn is_on(&self) -> bool {
        let state = lock(&self.state);
        state.clocks && state.active && state.domains.iter().all(|on| *on)
    }

    /// Whether everything is down.
    pub fn is_off(&self) -> bool {
        let state = lock(&self.state);
        !state.clocks && !state.active && state.domains.iter().all(|on| !on)
    }

    pub fn events(&self) -> Vec<PowerEvent> {
        lock(&self.state).events.clone()
    }

    pub fn clear_events(&self) {
        lock(&self.state).events.clear();
    }

    /// Number of completed power-on sequences.
    pub fn power_ons(&self) -> usize {
        lock(&self.state)
            .events
            .iter()
            .filter(|e| **e == PowerEvent::Resume)
            .count()
    }

    pub fn fail_domain(&self, index: Option<usize>) {
        lock(&self.state).fail_domain = index;
    }
}

impl PowerRails for SimPower {
    fn enable_clocks(&self) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        state.clocks = true;
        state.events.push(PowerEvent::ClocksOn);
        Ok(())
    }

    fn disable_clocks(&self) {
        let mut state = lock(&self.state);
        state.clocks = false;
        state.events.push(PowerEvent::ClocksOff);
    }

    fn domain_count(&self) -> usize {
        lock(&self.state).domains.len()
    }

    fn resume_domain(&self, index: usize) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        if state.fail_domain == Some(index) {
            return Err(HwError::NotReady(format!("power domain {index}")));
        }
        if let Some(on) = state.domains.get_mut(index) {
            *on = true;
        }
        state.events.push(PowerEvent::DomainOn(index));
        Ok(())
    }

    fn suspend_domain(&self, index: usize) {
        let mut state = lock(&self.state);
        if let Some(on) = state.domains.get_mut(index) {
            *on = false;
        }
        state.events.push(PowerEvent::DomainOff(index));
    }

    fn runtime_resume(&self) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        state.active = true;
        state.events.push(PowerEvent::Resume);
        Ok(())
    }

    fn runtime_suspend(&self) {
        {
            let mut state = lock(&self.state);
            state.active = false;
            state.events.push(PowerEvent::Suspend);
        }
        for core in &self.cores {
            core.power_loss();
        }
    }

    fn clock_rate(&self) -> u64 {
        lock(&self.state).rate
    }

    fn set_clock_rate(&self, hz: u64) -> Result<(), HwError> {
        if hz == 0 {
            return Err(HwError::Failed("zero clock rate".into()));
        }
        lock(&self.state).rate = hz;
        Ok(())
    }
}

/// Soft-reset lines. Releasing the last line resets every core.
pub struct SimReset {
    cores: Vec<Arc<SimCore>>,
    lines: usize,
    asserted: Mutex<Vec<bool>>,
    resets: Mutex<usize>,
}

impl SimReset {
    pub(crate) fn new(cores: Vec<Arc<SimCore>>, lines: usize) -> Self {
        Self {
            cores,
            lines,
            asserted: Mutex::new(vec![false; lines]),
            resets: Mutex::new(0),
        }
    }

    /// Completed assert/deassert cycles.
    pub fn resets(&self) -> usize {
        *lock(&self.resets)
    }

    pub fn any_asserted(&self) -> bool {
        lock(&self.asserted).iter().any(|a| *a)
    }
}

impl ResetControl for SimReset {
    fn line_count(&self) -> usize {
        self.lines
    }

    fn assert_line(&self, index: usize) -> Result<(), HwError> {
        let mut asserted = lock(&self.asserted);
        let line = asserted
            .get_mut(index)
            .ok_or_else(|| HwError::Failed(format!("no reset line {index}")))?;
        *line = true;
        Ok(())
    }

    fn deassert_line(&self, index: usize) -> Result<(), HwError> {
        let released = {
            let mut asserted = lock(&self.asserted);
            let line = asserted
                .get_mut(index)
                .ok_or_else(|| HwError::Failed(format!("no reset line {index}")))?;
            let was_asserted = std::mem::replace(line, false);
            was_asserted && asserted.iter().all(|a| !a)
        };
        if released {
            for core in &self.cores {
                core.reset();
            }
            *lock(&self.resets) += 1;
        }
        Ok(())
    }
}
