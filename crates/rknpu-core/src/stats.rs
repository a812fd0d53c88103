use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Device-wide counters.
///
/// Updated from the submit, interrupt and recovery paths; safe to read from any thread.
#[derive(Debug, Default)]
pub struct NpuStats {
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_aborted: AtomicU64,
    jobs_timed_out: AtomicU64,
    batches_committed: AtomicU64,

    spurious_irqs: AtomicU64,
    mismatched_irqs: AtomicU64,
    soft_resets: AtomicU64,
    guard_pages_mapped: AtomicU64,
}

impl NpuStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_jobs_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_aborted(&self) {
        self.jobs_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_timed_out(&self) {
        self.jobs_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches_committed(&self) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_spurious_irqs(&self) {
        self.spurious_irqs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mismatched_irqs(&self) {
        self.mismatched_irqs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_soft_resets(&self) {
        self.soft_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_guard_pages_mapped(&self, pages: u64) {
        self.guard_pages_mapped.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NpuStatsSnapshot {
        NpuStatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_aborted: self.jobs_aborted.load(Ordering::Relaxed),
            jobs_timed_out: self.jobs_timed_out.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),

            spurious_irqs: self.spurious_irqs.load(Ordering::Relaxed),
            mismatched_irqs: self.mismatched_irqs.load(Ordering::Relaxed),
            soft_resets: self.soft_resets.load(Ordering::Relaxed),
            guard_pages_mapped: self.guard_pages_mapped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NpuStatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_aborted: u64,
    pub jobs_timed_out: u64,
    pub batches_committed: u64,

    pub spurious_irqs: u64,
    pub mismatched_irqs: u64,
    pub soft_resets: u64,
    pub guard_pages_mapped: u64,
}
