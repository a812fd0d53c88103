//! Register file of one NPU core.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::lock;
use rknpu_core::CoreRegs;
use rknpu_protocol::regs::{iommu, pc};

pub const SIM_VERSION: u32 = 0x4650_0000;
pub const SIM_VERSION_NUM: u32 = 0x0001_0017;

/// How a core reacts to a start strobe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Retires the batch at once and raises a matching interrupt.
    Complete,
    /// Accepts the batch and never finishes it.
    Hang,
    /// Raises an interrupt with this status instead of the programmed mask.
    Status(u32),
    /// Waits for [`SimCore::finish`].
    Manual,
}

/// Registers captured when a batch was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub data_addr: u32,
    pub data_amount: u32,
    pub int_mask: u32,
    pub task_control: u32,
    pub dma_base: u32,
    pub len: u32,
}

/// Interrupt lines of every core, delivered in order on one dispatcher thread.
pub(crate) struct IrqLines {
    tx: Mutex<Sender<usize>>,
    rx: Mutex<Option<Receiver<usize>>>,
}

impl IrqLines {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(Some(rx)),
        }
    }

    fn raise(&self, core: usize) {
        // Nobody listening once the dispatcher is gone.
        let _ = lock(&self.tx).send(core);
    }

    pub fn take_receiver(&self) -> Option<Receiver<usize>> {
        lock(&self.rx).take()
    }
}

struct CoreState {
    regs: HashMap<u32, u32>,
    behavior: Behavior,
    batches: Vec<Batch>,
    writes: Vec<(u32, u32)>,
    in_flight: Option<Batch>,
}

impl CoreState {
    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn retire(&mut self, status: u32, len: u32, counter_offset: u32, counter_mask: u32) {
        self.regs.insert(pc::INT_STATUS, status);
        self.regs.insert(pc::INT_RAW_STATUS, status);
        let counter = (self.reg(counter_offset) + len) & counter_mask;
        self.regs.insert(counter_offset, counter);
    }
}

pub struct SimCore {
    index: usize,
    counter_offset: u32,
    counter_mask: u32,
    state: Mutex<CoreState>,
    irq: Arc<IrqLines>,
}

impl SimCore {
    pub(crate) fn new(index: usize, counter_offset: u32, counter_mask: u32, irq: Arc<IrqLines>) -> Self {
        let regs = HashMap::from([(pc::VERSION, SIM_VERSION), (pc::VERSION_NUM, SIM_VERSION_NUM)]);
        Self {
            index,
            counter_offset,
            counter_mask,
            state: Mutex::new(CoreState {
                regs,
                behavior: Behavior::Complete,
                batches: Vec::new(),
                writes: Vec::new(),
                in_flight: None,
            }),
            irq,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        lock(&self.state).behavior = behavior;
    }

    pub fn reg(&self, offset: u32) -> u32 {
        lock(&self.state).reg(offset)
    }

    /// Sets a register without going through the write side effects.
    pub fn set_reg(&self, offset: u32, value: u32) {
        lock(&self.state).regs.insert(offset, value);
    }

    /// Every batch started so far.
    pub fn batches(&self) -> Vec<Batch> {
        lock(&self.state).batches.clone()
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        lock(&self.state).writes.clone()
    }

    pub fn clear_log(&self) {
        let mut state = lock(&self.state);
        state.batches.clear();
        state.writes.clear();
    }

    /// Completed-task counter as the hardware reports it.
    pub fn task_counter(&self) -> u32 {
        self.reg(self.counter_offset)
    }

    pub fn in_flight(&self) -> Option<Batch> {
        lock(&self.state).in_flight
    }

    /// Retires the batch in flight under [`Behavior::Manual`]. Returns `false` if there is none.
    pub fn finish(&self) -> bool {
        let retired = {
            let mut state = lock(&self.state);
            match state.in_flight.take() {
                Some(batch) => {
                    state.retire(batch.int_mask, batch.len, self.counter_offset, self.counter_mask);
                    true
                }
                None => false,
            }
        };
        if retired {
            self.irq.raise(self.index);
        }
        retired
    }

    /// Raises an interrupt with `status` latched, whether or not a batch is running.
    pub fn raise(&self, status: u32) {
        {
            let mut state = lock(&self.state);
            state.regs.insert(pc::INT_STATUS, status);
            state.regs.insert(pc::INT_RAW_STATUS, status);
        }
        self.irq.raise(self.index);
    }

    /// Effect of the soft-reset lines: the core forgets its batch and status.
    pub(crate) fn reset(&self) {
        let mut state = lock(&self.state);
        state.in_flight = None;
        state.regs.insert(pc::INT_STATUS, 0);
        state.regs.insert(pc::INT_RAW_STATUS, 0);
        state.regs.insert(self.counter_offset, 0);
    }

    /// Effect of losing the power domain: translation entries lose their valid bit.
    pub(crate) fn power_loss(&self) {
        let mut state = lock(&self.state);
        for bank in iommu::BANKS {
            let offset = bank + iommu::DTE_ADDR;
            let dte = state.reg(offset);
            state.regs.insert(offset, dte & !iommu::DTE_VALID);
        }
    }

    fn start(&self, state: &mut CoreState) -> bool {
        let task_control = state.reg(pc::TASK_CONTROL);
        let batch = Batch {
            data_addr: state.reg(pc::DATA_ADDR),
            data_amount: state.reg(pc::DATA_AMOUNT),
            int_mask: state.reg(pc::INT_MASK),
            task_control,
            dma_base: state.reg(pc::DMA_BASE_ADDR),
            len: task_control & self.counter_mask,
        };
        trace!(core = self.index, ?batch, "sim batch start");
        state.batches.push(batch);
        match state.behavior {
            Behavior::Complete => {
                state.retire(batch.int_mask, batch.len, self.counter_offset, self.counter_mask);
                true
            }
            Behavior::Status(status) => {
                state.regs.insert(pc::INT_STATUS, status);
                state.regs.insert(pc::INT_RAW_STATUS, status);
                true
            }
            Behavior::Hang | Behavior::Manual => {
                state.in_flight = Some(batch);
                false
            }
        }
    }
}

impl CoreRegs for SimCore {
    fn read32(&self, offset: u32) -> u32 {
        self.reg(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        let raise = {
            let mut state = lock(&self.state);
            state.writes.push((offset, value));
            match offset {
                pc::INT_CLEAR => {
                    let status = state.reg(pc::INT_STATUS) & !value;
                    let raw = state.reg(pc::INT_RAW_STATUS) & !value;
                    state.regs.insert(pc::INT_STATUS, status);
                    state.regs.insert(pc::INT_RAW_STATUS, raw);
                    false
                }
                pc::OP_EN => {
                    state.regs.insert(offset, value);
                    value == 1 && self.start(&mut state)
                }
                _ => {
                    state.regs.insert(offset, value);
                    false
                }
            }
        };
        if raise {
            self.irq.raise(self.index);
        }
    }
}

impl std::fmt::Debug for SimCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCore")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
