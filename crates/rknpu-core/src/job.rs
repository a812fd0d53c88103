//! Execution record of one submission.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffer::Buffer;
use crate::config::HwConfig;
use crate::error::{NpuError, Result};
use crate::guard::GuardSet;
use crate::power::PowerRef;
use crate::sync::lock;
use rknpu_protocol::{JobFlags, SubcoreTask, SyncFlags, MAX_CORES, SUBCORE_TASK_SLOTS};

/// Contiguous run of task records assigned to one core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreRange {
    pub start: u32,
    pub count: u32,
}

impl CoreRange {
    pub fn end(&self) -> u64 {
        self.start as u64 + self.count as u64
    }

    /// Number of commits needed when one commit carries at most `max` tasks.
    pub fn batches(&self, max: u32) -> u32 {
        self.count.div_ceil(max)
    }

    /// Tasks of batch `index`.
    pub fn batch(&self, index: u32, max: u32) -> CoreRange {
        let done = index.saturating_mul(max);
        CoreRange {
            start: self.start.saturating_add(done),
            count: self.count.saturating_sub(done).min(max),
        }
    }
}

/// Share `index` of `parts` contiguous shares of `global`; earlier shares take the remainder.
pub fn share(global: CoreRange, parts: u32, index: u32) -> CoreRange {
    if parts <= 1 {
        return global;
    }
    let base = global.count / parts;
    let extra = global.count % parts;
    let before = index * base + index.min(extra);
    CoreRange {
        start: global.start.saturating_add(before),
        count: base + u32::from(index < extra),
    }
}

/// Task range a core of a job using `use_cores` cores works on.
///
/// Multi-core devices take the range from the submission's per-core slots (slot `core` for jobs
/// on one or two cores, slot `core + 2` for jobs on three). A slot with no tasks falls back to the
/// submission's global range: the whole of it for a job on one core, otherwise the share at
/// `ordinal`, the core's position among the job's cores. Single-core devices always use the
/// global range.
pub fn core_range(
    hw: &HwConfig,
    task_start: u32,
    task_number: u32,
    subcore: &[SubcoreTask; SUBCORE_TASK_SLOTS],
    use_cores: u32,
    core: usize,
    ordinal: u32,
) -> CoreRange {
    let global = CoreRange {
        start: task_start,
        count: task_number,
    };
    if !hw.is_multicore() {
        return global;
    }
    let slot = match use_cores {
        1 | 2 => core,
        3 => core + 2,
        _ => return global,
    };
    match subcore.get(slot) {
        Some(s) if s.task_number != 0 => CoreRange {
            start: s.task_start,
            count: s.task_number,
        },
        _ => share(global, use_cores, ordinal),
    }
}

/// Resources a job holds until it has finished.
///
/// Released in field order after imported buffers are synced back to the CPU: guard pages are
/// unmapped before the power reference goes.
#[derive(Debug, Default)]
pub struct JobResources {
    pub sync_back: Vec<Arc<Buffer>>,
    pub guards: Option<GuardSet>,
    pub power: Option<PowerRef>,
}

impl Drop for JobResources {
    fn drop(&mut self) {
        for buffer in &self.sync_back {
            buffer.sync(SyncFlags::FROM_DEVICE);
        }
    }
}

/// What the client asked for, before it is bound to cores.
#[derive(Debug)]
pub struct JobRequest {
    pub flags: JobFlags,
    pub timeout: Duration,
    pub core_mask: u32,
    pub task_start: u32,
    pub task_number: u32,
    pub subcore_task: [SubcoreTask; SUBCORE_TASK_SLOTS],
    pub task_buffer: Arc<Buffer>,
    pub task_base_addr: u64,
    pub resources: JobResources,
}

#[derive(Debug, Default)]
struct JobTiming {
    committed_at: Option<Instant>,
    hw_elapsed: Duration,
}

/// A job bound to its cores.
///
/// Shared between the submitting thread, each participating core's queue and the interrupt
/// path. Per-core state is only touched by the path owning that core; the cross-core countdowns
/// decide which caller commits the job and which one finishes it.
pub struct Job {
    id: u64,
    flags: JobFlags,
    core_mask: u32,
    ranges: [Option<CoreRange>; MAX_CORES],
    task_number: u32,
    task_buffer: Arc<Buffer>,
    task_base_addr: u64,
    timeout: Duration,
    created_at: Instant,

    run_count: AtomicU32,
    interrupt_count: AtomicU32,
    submit_count: [AtomicU32; MAX_CORES],
    irq_entry: [AtomicBool; MAX_CORES],
    int_mask: [AtomicU32; MAX_CORES],
    int_status: [AtomicU32; MAX_CORES],

    done: AtomicBool,
    failure: Mutex<Option<NpuError>>,
    timing: Mutex<JobTiming>,
    resources: Mutex<Option<JobResources>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("core_mask", &format_args!("{:#x}", self.core_mask))
            .field("ranges", &self.ranges)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl Job {
    pub(crate) fn new(
        id: u64,
        request: JobRequest,
        core_mask: u32,
        ranges: [Option<CoreRange>; MAX_CORES],
    ) -> Self {
        let use_cores = core_mask.count_ones();
        Self {
            id,
            flags: request.flags,
            core_mask,
            ranges,
            task_number: request.task_number,
            task_buffer: request.task_buffer,
            task_base_addr: request.task_base_addr,
            timeout: request.timeout,
            created_at: Instant::now(),
            run_count: AtomicU32::new(use_cores),
            interrupt_count: AtomicU32::new(use_cores),
            submit_count: Default::default(),
            irq_entry: Default::default(),
            int_mask: Default::default(),
            int_status: Default::default(),
            done: AtomicBool::new(false),
            failure: Mutex::new(None),
            timing: Mutex::new(JobTiming::default()),
            resources: Mutex::new(Some(request.resources)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    /// Cores the job runs on, after automatic selection.
    pub fn core_mask(&self) -> u32 {
        self.core_mask
    }

    pub fn use_cores(&self) -> u32 {
        self.core_mask.count_ones()
    }

    pub fn cores(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CORES).filter(move |core| self.ranges[*core].is_some())
    }

    pub fn range(&self, core: usize) -> Option<CoreRange> {
        self.ranges.get(core).copied().flatten()
    }

    /// Tasks the job was submitted with; its cores' ranges add up to this.
    pub fn task_count(&self) -> u32 {
        self.task_number
    }

    pub fn task_buffer(&self) -> &Arc<Buffer> {
        &self.task_buffer
    }

    pub fn task_base_addr(&self) -> u64 {
        self.task_base_addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Queue whose waiters are woken when the job finishes: core 0's for jobs spanning several
    /// cores, the job's own core otherwise.
    pub fn wait_core(&self) -> usize {
        if self.use_cores() > 1 {
            0
        } else {
            self.core_mask.trailing_zeros() as usize
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Marks the job finished. Returns `false` if it already was.
    pub(crate) fn mark_done(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    /// Called by each core when it takes the job as its running job. Returns `true` for the last
    /// core, which then commits the job everywhere.
    pub(crate) fn claim_core(&self) -> bool {
        countdown(&self.run_count)
    }

    /// Called by each core once it is finished with the job. Returns `true` exactly once, for the
    /// last core.
    pub(crate) fn retire_core(&self) -> bool {
        countdown(&self.interrupt_count)
    }

    pub(crate) fn submitted_batches(&self, core: usize) -> u32 {
        self.submit_count[core].load(Ordering::Acquire)
    }

    pub(crate) fn note_batch_done(&self, core: usize) -> u32 {
        self.submit_count[core].fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn set_irq_entry(&self, core: usize) {
        self.irq_entry[core].store(true, Ordering::Release);
    }

    pub(crate) fn irq_entered(&self, core: usize) -> bool {
        self.irq_entry[core].load(Ordering::Acquire)
    }

    pub(crate) fn set_expected_mask(&self, core: usize, mask: u32) {
        self.int_mask[core].store(mask, Ordering::Release);
    }

    pub fn expected_mask(&self, core: usize) -> u32 {
        self.int_mask[core].load(Ordering::Acquire)
    }

    pub(crate) fn set_int_status(&self, core: usize, status: u32) {
        self.int_status[core].store(status, Ordering::Release);
    }

    pub fn int_status(&self, core: usize) -> u32 {
        self.int_status[core].load(Ordering::Acquire)
    }

    pub(crate) fn mark_committed(&self, now: Instant) {
        lock(&self.timing).committed_at = Some(now);
    }

    pub(crate) fn committed_at(&self) -> Option<Instant> {
        lock(&self.timing).committed_at
    }

    pub(crate) fn record_hw_elapsed(&self, now: Instant) {
        let mut timing = lock(&self.timing);
        if let Some(committed) = timing.committed_at {
            timing.hw_elapsed = now.saturating_duration_since(committed);
        }
    }

    pub fn hw_elapsed(&self) -> Duration {
        lock(&self.timing).hw_elapsed
    }

    /// Keeps the first failure reported by any core.
    pub(crate) fn record_failure(&self, err: NpuError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            debug!(job = self.id, %err, "job failed");
            *failure = Some(err);
        }
    }

    pub(crate) fn take_outcome(&self) -> Result<()> {
        match lock(&self.failure).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drops whatever the job still holds: imported buffers are synced back, guard pages
    /// removed and the power reference released. Later calls do nothing.
    pub(crate) fn release_resources(&self) {
        let resources = lock(&self.resources).take();
        if let Some(resources) = resources {
            debug!(
                job = self.id,
                guards = resources.guards.as_ref().map_or(0, GuardSet::len),
                "releasing job resources"
            );
            drop(resources);
        }
    }
}

fn countdown(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .map_or(false, |previous| previous == 1)
}
