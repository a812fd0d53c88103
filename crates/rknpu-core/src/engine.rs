//! Job scheduling across the NPU cores.
//!
//! Each core has a FIFO of pending jobs and at most one running job. A job spanning several cores
//! sits in each of their queues and is only programmed into the hardware once it is the running
//! job of every one of them; the cores then execute it independently and the job finishes when
//! the last core retires it.
//!
//! All queue state lives behind one mutex that is never held across a register access or a
//! blocking call. Register programming happens on whichever thread made a core eligible: the
//! submitter, the interrupt path after a completion, or the recovery path after a soft reset.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::config::{DeviceConfig, HwConfig};
use crate::diag::{self, CoreSnapshot, IommuBank, TimeoutDump};
use crate::error::{NpuError, Result};
use crate::hw::CoreRegs;
use crate::job::{core_range, CoreRange, Job, JobRequest};
use crate::stats::NpuStats;
use crate::sync::{lock, WaitQueue};
use crate::workqueue::WorkQueue;
use rknpu_protocol::regs::{self, engine, pc};
use rknpu_protocol::{
    core_mask_bit, JobFlags, RknpuTask, SubmitResult, CORE_AUTO_MASK, MAX_CORES,
};

/// What the interrupt handler did with an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOutcome {
    /// No job was running on the core; the interrupt was acknowledged and dropped.
    Spurious,
    /// The status did not match the running batch; the job stays in place.
    Mismatch { status: u32, expected: u32 },
    /// The running batch completed.
    Completed,
}

/// Observable state of one core's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub running: Option<u64>,
    pub task_load: u64,
}

/// Busy time of one core over the last sampling period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreLoad {
    pub core: usize,
    pub busy: Duration,
    /// Busy time as a percentage of the sampling period.
    pub percent: u32,
}

#[derive(Default)]
struct CoreQueue {
    pending: VecDeque<Arc<Job>>,
    running: Option<Arc<Job>>,
    /// Tasks of every job queued or running here.
    task_load: u64,
    busy: Duration,
    total_busy: Duration,
    /// Start of the running job's not yet accounted busy time.
    recorder: Option<Instant>,
}

impl CoreQueue {
    fn is_running(&self, job: &Arc<Job>) -> bool {
        self.running.as_ref().is_some_and(|r| Arc::ptr_eq(r, job))
    }

    /// Clears the running slot, charging the time since the last recorder stamp.
    fn retire_running(&mut self, count: u32, now: Instant) {
        self.running = None;
        self.task_load = self.task_load.saturating_sub(count as u64);
        if let Some(recorded) = self.recorder.take() {
            self.busy += now.saturating_duration_since(recorded);
        }
    }

    fn remove_pending(&mut self, job: &Arc<Job>, count: u32) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| !Arc::ptr_eq(p, job));
        if self.pending.len() == before {
            return false;
        }
        self.task_load = self.task_load.saturating_sub(count as u64);
        true
    }
}

/// Index of the least loaded core; ties go to the lowest index.
pub fn least_loaded(loads: impl IntoIterator<Item = (usize, u64)>) -> Option<usize> {
    loads
        .into_iter()
        .min_by_key(|&(core, load)| (load, core))
        .map(|(core, _)| core)
}

type Bound = [Option<CoreRange>; MAX_CORES];

pub struct Engine {
    cfg: DeviceConfig,
    cores: Vec<Arc<dyn CoreRegs>>,
    queues: Mutex<Vec<CoreQueue>>,
    waiters: Vec<WaitQueue>,
    soft_resetting: AtomicBool,
    next_job_id: AtomicU64,
    stats: Arc<NpuStats>,
    cleanup: WorkQueue,
}

impl Engine {
    pub(crate) fn new(
        cfg: DeviceConfig,
        cores: Vec<Arc<dyn CoreRegs>>,
        stats: Arc<NpuStats>,
    ) -> Self {
        let n = cores.len();
        Self {
            cfg,
            cores,
            queues: Mutex::new((0..n).map(|_| CoreQueue::default()).collect()),
            waiters: (0..n).map(|_| WaitQueue::new()).collect(),
            soft_resetting: AtomicBool::new(false),
            next_job_id: AtomicU64::new(1),
            stats,
            cleanup: WorkQueue::new("rknpu-job-cleanup"),
        }
    }

    fn hw(&self) -> &HwConfig {
        &self.cfg.hw
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    /// Cores a submission may name.
    pub fn available_mask(&self) -> u32 {
        self.hw().core_mask & (core_mask_bit(self.cores.len()) - 1)
    }

    /// Task ranges for running `request` on `mask`, checked against the task buffer.
    ///
    /// The ranges of a job on several cores must add up to its task number.
    fn bind(&self, request: &JobRequest, mask: u32) -> Result<Bound> {
        let capacity = request.task_buffer.task_capacity();
        let use_cores = mask.count_ones();
        let mut ranges = [None; MAX_CORES];
        let mut ordinal = 0;
        let mut total = 0u64;
        for (core, slot) in ranges.iter_mut().enumerate().take(self.cores.len()) {
            if mask & core_mask_bit(core) == 0 {
                continue;
            }
            let range = core_range(
                self.hw(),
                request.task_start,
                request.task_number,
                &request.subcore_task,
                use_cores,
                core,
                ordinal,
            );
            ordinal += 1;
            if range.count == 0 {
                return Err(if use_cores > 1 {
                    NpuError::InvalidArgument(format!(
                        "core {core} has no tasks in a {}-task job on mask {mask:#x}",
                        request.task_number
                    ))
                } else {
                    NpuError::ZeroTaskCount
                });
            }
            if range.end() > capacity {
                return Err(NpuError::TaskRangeOutOfBounds {
                    core,
                    start: range.start as u64,
                    end: range.end(),
                    capacity,
                });
            }
            total += range.count as u64;
            *slot = Some(range);
        }
        if use_cores > 1 && total != request.task_number as u64 {
            return Err(NpuError::InvalidArgument(format!(
                "per-core task ranges cover {total} tasks, job has {}",
                request.task_number
            )));
        }
        Ok(ranges)
    }

    /// Checks that do not need the task buffer.
    pub fn check_submission(&self, flags: JobFlags, task_number: u32, core_mask: u32) -> Result<()> {
        if task_number == 0 {
            return Err(NpuError::ZeroTaskCount);
        }
        if !flags.contains(JobFlags::PC) {
            return Err(NpuError::InvalidArgument(
                "only program-counter mode jobs are supported".into(),
            ));
        }
        let available = self.available_mask();
        if core_mask & !available != 0 {
            return Err(NpuError::InvalidCoreMask {
                mask: core_mask,
                available,
            });
        }
        Ok(())
    }

    /// Binds `request` to every core mask it may run on: the requested mask, or each available
    /// core on its own under automatic selection.
    fn bind_candidates(&self, request: &JobRequest) -> Result<Vec<(u32, Bound)>> {
        self.check_submission(request.flags, request.task_number, request.core_mask)?;
        let available = self.available_mask();
        let candidates: Vec<u32> = if request.core_mask == CORE_AUTO_MASK {
            (0..self.cores.len())
                .map(core_mask_bit)
                .filter(|bit| available & bit != 0)
                .collect()
        } else {
            vec![request.core_mask]
        };
        candidates
            .into_iter()
            .map(|mask| self.bind(request, mask).map(|ranges| (mask, ranges)))
            .collect()
    }

    /// Runs every check [`Engine::submit`] makes without queueing anything.
    pub fn validate(&self, request: &JobRequest) -> Result<()> {
        self.bind_candidates(request).map(drop)
    }

    /// Validates `request`, binds it to its cores and queues it.
    ///
    /// Automatic core selection picks the core with the fewest queued tasks at the moment the
    /// job is queued.
    pub fn submit(&self, request: JobRequest) -> Result<Arc<Job>> {
        let bound = self.bind_candidates(&request)?;
        let available = self.available_mask();

        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let job = {
            let mut queues = lock(&self.queues);
            let (mask, ranges) = if request.core_mask == CORE_AUTO_MASK {
                let picked = least_loaded(
                    bound
                        .iter()
                        .map(|(mask, _)| mask.trailing_zeros() as usize)
                        .map(|core| (core, queues[core].task_load)),
                )
                .and_then(|core| bound.iter().find(|(mask, _)| *mask == core_mask_bit(core)));
                match picked {
                    Some(&(mask, ranges)) => (mask, ranges),
                    None => return Err(NpuError::InvalidCoreMask { mask: 0, available }),
                }
            } else {
                bound[0]
            };

            let job = Arc::new(Job::new(id, request, mask, ranges));
            for core in job.cores() {
                let count = job.range(core).map_or(0, |r| r.count);
                let queue = &mut queues[core];
                queue.pending.push_back(job.clone());
                queue.task_load += count as u64;
            }
            job
        };
        self.stats.inc_jobs_submitted();
        debug!(
            job = job.id(),
            mask = format_args!("{:#x}", job.core_mask()),
            tasks = job.task_count(),
            flags = ?job.flags(),
            "job queued"
        );

        for core in job.cores() {
            self.advance(core);
        }
        Ok(job)
    }

    /// Starts the next job on `core` if the core is idle.
    pub fn advance(&self, core: usize) {
        if self.soft_resetting.load(Ordering::Acquire) {
            return;
        }
        let job = {
            let mut queues = lock(&self.queues);
            let Some(queue) = queues.get_mut(core) else {
                return;
            };
            if queue.running.is_some() {
                return;
            }
            let Some(job) = queue.pending.pop_front() else {
                return;
            };
            let now = Instant::now();
            queue.running = Some(job.clone());
            queue.recorder = Some(now);
            job.mark_committed(now);
            job
        };
        if job.claim_core() {
            self.commit_job(&job);
        }
    }

    fn commit_job(&self, job: &Arc<Job>) {
        for core in job.cores() {
            if let Err(err) = self.commit(job, core) {
                warn!(job = job.id(), core, %err, "commit failed");
                self.finish_core(job, core, Err(err));
            }
        }
    }

    /// Programs the next batch of `job` into `core` and starts it.
    fn commit(&self, job: &Job, core: usize) -> Result<()> {
        let hw = self.hw();
        let regs = &self.cores[core];
        let range = job
            .range(core)
            .ok_or_else(|| NpuError::InvalidArgument(format!("job not bound to core {core}")))?;
        let batch = range.batch(job.submitted_batches(core), hw.max_submit_number);
        if batch.count == 0 {
            return Err(NpuError::InvalidArgument(format!(
                "no tasks left for core {core}"
            )));
        }

        regs.write32(pc::DATA_ADDR, regs::PC_SLAVE_MODE);
        if !job.flags().contains(JobFlags::PC) {
            return Err(NpuError::InvalidArgument(
                "only program-counter mode jobs are supported".into(),
            ));
        }
        if hw.is_multicore() {
            for reg in engine::MULTICORE_PRIME {
                regs.write32(reg, regs::multicore_prime_value(core));
            }
        }

        let tasks = job.task_buffer();
        let first = tasks.read_task(batch.start)?;
        let last = tasks.read_task(batch.start + batch.count - 1)?;
        let data_amount = regs::pc_data_amount(first.regcfg_amount, hw.pc_data_amount_scale);
        let task_control = regs::pc_task_control(
            batch.count,
            job.flags().contains(JobFlags::PINGPONG),
            hw.pc_task_number_bits,
        );
        debug!(
            job = job.id(),
            core,
            task_start = batch.start,
            task_number = batch.count,
            regcmd_addr = format_args!("{:#x}", first.regcmd_addr),
            data_amount,
            int_mask = format_args!("{:#x}", last.int_mask),
            int_clear = format_args!("{:#x}", first.int_mask),
            task_control = format_args!("{task_control:#x}"),
            dma_base = format_args!("{:#x}", job.task_base_addr()),
            "commit"
        );

        regs.write32(pc::DATA_ADDR, first.regcmd_addr as u32);
        regs.write32(pc::DATA_AMOUNT, data_amount);
        regs.write32(pc::INT_MASK, last.int_mask);
        regs.write32(pc::INT_CLEAR, first.int_mask);
        regs.write32(pc::TASK_CONTROL, task_control);
        regs.write32(pc::DMA_BASE_ADDR, job.task_base_addr() as u32);
        job.set_expected_mask(core, last.int_mask);

        regs.write32(pc::INT_CLEAR, regs::INT_CLEAR_ALL);
        regs.write32(pc::OP_EN, 1);
        regs.write32(pc::OP_EN, 0);
        self.stats.inc_batches_committed();
        Ok(())
    }

    /// Interrupt handler body for `core`.
    pub fn handle_irq(&self, core: usize) -> IrqOutcome {
        let Some(regs) = self.cores.get(core) else {
            warn!(core, "interrupt for unknown core");
            return IrqOutcome::Spurious;
        };
        let raw_status = regs.read32(pc::INT_RAW_STATUS);
        let status = regs.read32(pc::INT_STATUS);
        let task_counter = diag::task_counter(regs.as_ref(), self.hw());
        debug!(core, raw_status, status, task_counter, "irq");

        let running = {
            let queues = lock(&self.queues);
            let running = queues[core].running.clone();
            if let Some(job) = &running {
                job.set_irq_entry(core);
            }
            running
        };
        let Some(job) = running else {
            regs.write32(pc::INT_CLEAR, regs::INT_CLEAR_ALL);
            self.stats.inc_spurious_irqs();
            debug!(core, "irq without running job");
            self.advance(core);
            return IrqOutcome::Spurious;
        };

        job.set_int_status(core, status);
        let expected = job.expected_mask(core);
        if regs::fuzz_status(status) != expected {
            warn!(
                job = job.id(),
                core,
                status = format_args!("{status:#x}"),
                raw_status = format_args!("{raw_status:#x}"),
                expected = format_args!("{expected:#x}"),
                fuzz = format_args!("{:#x}", regs::fuzz_status(status)),
                task_counter,
                "invalid irq status"
            );
            regs.write32(pc::INT_CLEAR, regs::INT_CLEAR_ALL);
            self.stats.inc_mismatched_irqs();
            return IrqOutcome::Mismatch { status, expected };
        }

        regs.write32(pc::INT_CLEAR, regs::INT_CLEAR_ALL);
        self.complete(&job, core, Ok(()));
        IrqOutcome::Completed
    }

    /// Records a finished batch of `job` on `core`, committing the next batch if tasks remain.
    ///
    /// Calls for a job that is no longer running on `core` are ignored.
    pub fn complete(&self, job: &Arc<Job>, core: usize, result: Result<()>) {
        if !lock(&self.queues)
            .get(core)
            .is_some_and(|q| q.is_running(job))
        {
            debug!(job = job.id(), core, "stale completion ignored");
            return;
        }
        let batches = job
            .range(core)
            .map_or(0, |r| r.batches(self.hw().max_submit_number));
        let submitted = job.note_batch_done(core);
        if result.is_ok() && submitted < batches {
            if let Err(err) = self.commit(job, core) {
                warn!(job = job.id(), core, %err, "commit of next batch failed");
                self.finish_core(job, core, Err(err));
            }
            return;
        }
        self.finish_core(job, core, result);
    }

    fn finish_core(&self, job: &Arc<Job>, core: usize, result: Result<()>) {
        {
            let mut queues = lock(&self.queues);
            let queue = &mut queues[core];
            if !queue.is_running(job) {
                return;
            }
            let now = Instant::now();
            queue.retire_running(job.range(core).map_or(0, |r| r.count), now);
            job.record_hw_elapsed(now);
        }
        if let Err(err) = result {
            job.record_failure(err);
        }
        if job.retire_core() {
            self.finalize(job);
        }
        self.advance(core);
    }

    fn finalize(&self, job: &Arc<Job>) {
        if !job.mark_done() {
            return;
        }
        self.stats.inc_jobs_completed();
        debug!(
            job = job.id(),
            hw_elapsed_us = job.hw_elapsed().as_micros() as u64,
            "job done"
        );
        if job.flags().contains(JobFlags::NONBLOCK) {
            let job = job.clone();
            self.cleanup.queue(move || job.release_resources());
        }
        self.waiters[job.wait_core()].wake_all();
    }

    /// Blocks until `job` finishes, a soft reset starts, or the wait gives up.
    ///
    /// Each attempt waits for the job's timeout. After a timed-out attempt the wait continues
    /// only while the job was committed less than one timeout ago, since a job queued behind
    /// others has not had its full time on the hardware yet.
    pub fn wait(&self, job: &Arc<Job>) -> Result<SubmitResult> {
        let queue = &self.waiters[job.wait_core()];
        let diag_core = job.cores().next().unwrap_or(0);
        let regs = &self.cores[diag_core];
        let timeout = job.timeout();

        let mut attempts = 0;
        let signalled = loop {
            let signalled = queue.wait_until(timeout, || {
                job.is_done() || self.soft_resetting.load(Ordering::Acquire)
            });
            attempts += 1;
            if signalled || attempts >= self.cfg.wait_attempts {
                break signalled;
            }

            let elapsed = job.committed_at().map(|at| at.elapsed());
            let keep_waiting = elapsed.map_or(true, |elapsed| elapsed < timeout);
            let snap = CoreSnapshot::capture(regs.as_ref(), self.hw(), diag_core);
            warn!(
                job = job.id(),
                mask = format_args!("{:#x}", job.core_mask()),
                attempt = attempts,
                task_counter = snap.task_counter,
                raw_status = format_args!("{:#x}", snap.raw_status),
                int_status = format_args!("{:#x}", snap.int_status),
                pc_addr = format_args!("{:#x}", snap.data_addr),
                pc_amount = snap.data_amount,
                commit_elapsed_us = elapsed.map_or(0, |e| e.as_micros() as u64),
                timeout_us = timeout.as_micros() as u64,
                keep_waiting,
                "job wait timed out"
            );
            if !keep_waiting {
                break false;
            }
        };

        if job.is_done() {
            job.take_outcome()?;
            return Ok(SubmitResult {
                task_counter: job.task_count(),
                hw_elapse_time_ns: job.hw_elapsed().as_nanos() as u64,
                core_mask: job.core_mask(),
            });
        }
        if signalled {
            warn!(job = job.id(), "wait interrupted by soft reset");
            return Err(NpuError::Aborted);
        }

        let task_counter = diag::task_counter(regs.as_ref(), self.hw());
        error!(
            job = job.id(),
            task_counter,
            flags = ?job.flags(),
            elapsed_us = job.age().as_micros() as u64,
            "failed to wait for job"
        );
        TimeoutDump::capture(regs.as_ref(), diag_core).log(&self.leading_tasks(job, diag_core));
        self.stats.inc_jobs_timed_out();
        Err(NpuError::Timeout { task_counter })
    }

    fn leading_tasks(&self, job: &Job, core: usize) -> Vec<(u32, RknpuTask)> {
        let Some(range) = job.range(core) else {
            return Vec::new();
        };
        (range.start..range.start + range.count.min(3))
            .filter_map(|index| job.task_buffer().read_task(index).ok().map(|t| (index, t)))
            .collect()
    }

    /// Pulls a job whose wait failed off the queues.
    ///
    /// Pending entries are always removed. A running entry is removed when the job timed out, or
    /// when the core never raised an interrupt for it; otherwise the hardware may still finish
    /// it and the interrupt path retires it. Returns `true` when the failure was a timeout, in
    /// which case the cores can no longer be trusted and need a soft reset.
    pub fn abort(&self, job: &Arc<Job>, err: &NpuError) -> bool {
        if !self.cfg.abort_settle.is_zero() {
            std::thread::sleep(self.cfg.abort_settle);
        }
        let timed_out = err.is_timeout();
        {
            let mut queues = lock(&self.queues);
            let now = Instant::now();
            for core in job.cores() {
                let count = job.range(core).map_or(0, |r| r.count);
                let queue = &mut queues[core];
                queue.remove_pending(job, count);
                if queue.is_running(job) && (timed_out || !job.irq_entered(core)) {
                    queue.retire_running(count, now);
                }
            }
        }
        job.mark_done();
        self.stats.inc_jobs_aborted();

        if timed_out {
            error!(job = job.id(), flags = ?job.flags(), "job timeout");
            let snaps: Vec<CoreSnapshot> = job
                .cores()
                .map(|core| CoreSnapshot::capture(self.cores[core].as_ref(), self.hw(), core))
                .collect();
            let expected: Vec<u32> = job.cores().map(|core| job.expected_mask(core)).collect();
            diag::log_abort_state(&snaps, &expected, job.age().as_micros() as u64);
            if let Some(core0) = self.cores.first() {
                diag::log_iommu_banks(&IommuBank::capture_all(core0.as_ref()));
            }
        } else {
            warn!(
                job = job.id(),
                flags = ?job.flags(),
                %err,
                elapsed_us = job.age().as_micros() as u64,
                "job abort"
            );
        }

        // A timed out job's cores stay idle until the soft reset restarts them.
        if !timed_out || self.cfg.bypass_soft_reset {
            for core in job.cores() {
                self.advance(core);
            }
        }
        timed_out
    }

    /// Fails `job` everywhere it is still queued or running.
    fn cancel(&self, job: &Arc<Job>, err: NpuError) {
        let mut removed = 0;
        {
            let mut queues = lock(&self.queues);
            let now = Instant::now();
            for core in job.cores() {
                let count = job.range(core).map_or(0, |r| r.count);
                let queue = &mut queues[core];
                if queue.remove_pending(job, count) {
                    removed += 1;
                }
                if queue.is_running(job) {
                    queue.retire_running(count, now);
                    removed += 1;
                }
            }
        }
        if removed == 0 {
            return;
        }
        job.record_failure(err);
        for _ in 0..removed {
            if job.retire_core() {
                self.finalize(job);
            }
        }
    }

    /// Stops scheduling and wakes every waiter.
    pub(crate) fn begin_soft_reset(&self) {
        self.soft_resetting.store(true, Ordering::Release);
        for waiters in &self.waiters {
            waiters.wake_all();
        }
    }

    /// Fails every job the hardware was running; its state is lost across a reset.
    pub(crate) fn fail_running(&self) {
        let mut running: Vec<Arc<Job>> = Vec::new();
        for job in lock(&self.queues).iter().filter_map(|q| q.running.clone()) {
            if !running.iter().any(|r| Arc::ptr_eq(r, &job)) {
                running.push(job);
            }
        }
        for job in running {
            warn!(job = job.id(), "job lost to soft reset");
            self.cancel(&job, NpuError::Aborted);
        }
    }

    /// Resumes scheduling on every core.
    pub(crate) fn end_soft_reset(&self) {
        self.soft_resetting.store(false, Ordering::Release);
        for core in 0..self.cores.len() {
            self.advance(core);
        }
    }

    pub fn is_soft_resetting(&self) -> bool {
        self.soft_resetting.load(Ordering::Acquire)
    }

    /// Rolls each core's busy time into its load figure for the period just ended.
    pub fn sample_load(&self) {
        let now = Instant::now();
        for queue in lock(&self.queues).iter_mut() {
            if queue.running.is_some() {
                if let Some(recorded) = queue.recorder.replace(now) {
                    queue.busy += now.saturating_duration_since(recorded);
                }
            }
            queue.total_busy = std::mem::take(&mut queue.busy);
        }
    }

    pub fn core_loads(&self) -> Vec<CoreLoad> {
        let interval = self.cfg.load_interval.as_micros();
        lock(&self.queues)
            .iter()
            .enumerate()
            .map(|(core, queue)| CoreLoad {
                core,
                busy: queue.total_busy,
                percent: if interval == 0 {
                    0
                } else {
                    (queue.total_busy.as_micros() * 100 / interval).min(100) as u32
                },
            })
            .collect()
    }

    pub fn queue_snapshot(&self, core: usize) -> Option<QueueSnapshot> {
        lock(&self.queues).get(core).map(|queue| QueueSnapshot {
            pending: queue.pending.len(),
            running: queue.running.as_ref().map(|job| job.id()),
            task_load: queue.task_load,
        })
    }

    /// Jobs queued or running on any core.
    pub fn outstanding_jobs(&self) -> usize {
        lock(&self.queues)
            .iter()
            .map(|q| q.pending.len() + usize::from(q.running.is_some()))
            .sum()
    }

    /// Waits for deferred job cleanup queued so far.
    pub fn flush_cleanup(&self) {
        self.cleanup.flush();
    }

    pub(crate) fn shutdown(&self) {
        self.cleanup.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("cores", &self.cores.len())
            .field("soft_resetting", &self.is_soft_resetting())
            .finish_non_exhaustive()
    }
}
