//! One attached NPU and the client operations on it.
//!
//! [`Device`] ties the pieces together: sessions own buffers, submissions become jobs on the
//! [`Engine`], and every request runs with a [`PowerController`] reference held.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::config::DeviceConfig;
use crate::engine::{CoreLoad, Engine, IrqOutcome};
use crate::error::{NpuError, Result};
use crate::guard::{plan_guard_regions, GuardSet};
use crate::hw::{AttachResources, CoreRegs, DmaBufExporter, DmaMemory, Iommu, PowerRails, ResetControl};
use crate::job::{JobRequest, JobResources};
use crate::power::{revalidate_translation, PowerController, PowerSequencer};
use crate::session::Session;
use crate::stats::{NpuStats, NpuStatsSnapshot};
use crate::sync::lock;
use crate::workqueue::PeriodicTask;
use rknpu_protocol::{
    JobFlags, MemCreateArgs, MemCreated, MemSyncArgs, Request, Response, SubmitArgs,
    SubmitResult, SyncFlags,
};

pub struct Device {
    cfg: DeviceConfig,
    pub(crate) cores: Vec<Arc<dyn CoreRegs>>,
    dma: Arc<dyn DmaMemory>,
    dmabuf: Arc<dyn DmaBufExporter>,
    pub(crate) iommu: Option<Arc<dyn Iommu>>,
    pub(crate) rails: Arc<dyn PowerRails>,
    reset: Arc<dyn ResetControl>,
    pub(crate) power: PowerController,
    engine: Arc<Engine>,
    stats: Arc<NpuStats>,
    /// Holds taken through the power-on action.
    pub(crate) power_holds: AtomicU32,
    reset_lock: Mutex<()>,
    next_session: AtomicU64,
    sampler: Mutex<Option<PeriodicTask>>,
    detached: AtomicBool,
}

impl Device {
    /// Brings up a device over the hardware handed over by the attach layer.
    ///
    /// The NPU is powered on once to read its version and released again right away.
    pub fn attach(cfg: DeviceConfig, res: AttachResources) -> Result<Arc<Self>> {
        cfg.validate()?;
        if res.cores.len() != cfg.hw.num_cores {
            return Err(NpuError::InvalidArgument(format!(
                "{} register windows for {} cores",
                res.cores.len(),
                cfg.hw.num_cores
            )));
        }
        let core0 = res
            .cores
            .first()
            .cloned()
            .ok_or_else(|| NpuError::InvalidArgument("no register windows".into()))?;

        let power = PowerController::new(
            PowerSequencer {
                rails: res.power.clone(),
                iommu: res.iommu.clone(),
                core0,
                iommu_settle: cfg.iommu_settle,
            },
            cfg.power_put_delay,
        );
        let stats = Arc::new(NpuStats::new());
        let engine = Arc::new(Engine::new(cfg.clone(), res.cores.clone(), stats.clone()));
        let sampler = if cfg.load_interval.is_zero() {
            None
        } else {
            let engine = engine.clone();
            PeriodicTask::spawn("rknpu-load", cfg.load_interval, move || engine.sample_load())
        };

        let device = Arc::new(Self {
            cfg,
            cores: res.cores,
            dma: res.dma,
            dmabuf: res.dmabuf,
            iommu: res.iommu,
            rails: res.power,
            reset: res.reset,
            power,
            engine,
            stats,
            power_holds: AtomicU32::new(0),
            reset_lock: Mutex::new(()),
            next_session: AtomicU64::new(1),
            sampler: Mutex::new(sampler),
            detached: AtomicBool::new(false),
        });

        device.power.acquire()?;
        let version = device.hw_version();
        device.power.release();
        info!(
            cores = device.cores.len(),
            mask = format_args!("{:#x}", device.cfg.hw.core_mask),
            iommu = device.iommu.is_some(),
            dma_mask_bits = device.cfg.hw.dma_mask_bits,
            irqs = ?&device.cfg.hw.irq_names[..device.cores.len()],
            hw_version = format_args!("{version:#x}"),
            "rknpu attached"
        );
        Ok(device)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn iommu_enabled(&self) -> bool {
        self.iommu.is_some()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn power(&self) -> &PowerController {
        &self.power
    }

    pub fn stats(&self) -> NpuStatsSnapshot {
        self.stats.snapshot()
    }

    /// Busy time per core over the last sampling period.
    pub fn core_loads(&self) -> Vec<CoreLoad> {
        self.engine.core_loads()
    }

    pub fn open(&self) -> Session {
        let session = Session::new(self.next_session.fetch_add(1, Ordering::Relaxed));
        debug!(session = session.id(), "session opened");
        session
    }

    /// Ends `session`, releasing every buffer it still owns.
    pub fn close(&self, session: Session) {
        debug!(
            session = session.id(),
            buffers = session.buffer_count(),
            "session closed"
        );
        drop(session);
    }

    /// Runs one client request with a power reference held for its duration.
    pub fn ioctl(&self, session: &Session, request: Request) -> Result<Response> {
        let _power = self.power.acquire_ref()?;
        match request {
            Request::Action { code, value } => {
                self.action(code, value).map(|value| Response::Action { value })
            }
            Request::Submit(args) => self.submit(session, &args).map(Response::Submitted),
            Request::MemCreate(args) => self.mem_create(session, &args).map(Response::MemCreated),
            Request::MemMap { handle } => self
                .mem_map(session, handle)
                .map(|offset| Response::MemMapped { offset }),
            Request::MemDestroy { handle } => {
                self.mem_destroy(session, handle).map(|()| Response::Done)
            }
            Request::MemSync(args) => self.mem_sync(session, &args).map(|()| Response::Done),
        }
    }

    /// Allocates a buffer, or imports the foreign buffer named by `import_fd` when non-zero.
    pub fn mem_create(&self, session: &Session, args: &MemCreateArgs) -> Result<MemCreated> {
        let handle = session.allocate_handle();
        let page_size = self.cfg.guard.page_size;
        let buffer = if args.import_fd != 0 {
            Buffer::import(self.dmabuf.as_ref(), handle, args.import_fd, args.size, page_size)?
        } else {
            Buffer::allocate(&self.dma, handle, args.size, page_size)?
        };
        let buffer = session.insert(buffer);
        debug!(
            session = session.id(),
            handle,
            flags = ?args.flags,
            kind = ?buffer.kind(),
            "buffer created"
        );
        Ok(MemCreated {
            handle,
            size: buffer.size(),
            dma_addr: buffer.dma_addr(),
            sram_size: 0,
        })
    }

    pub fn mem_destroy(&self, session: &Session, handle: u32) -> Result<()> {
        let buffer = session.remove(handle)?;
        debug!(
            session = session.id(),
            handle,
            in_use = Arc::strong_count(&buffer) > 1,
            "buffer destroyed"
        );
        Ok(())
    }

    pub fn mem_sync(&self, session: &Session, args: &MemSyncArgs) -> Result<()> {
        session.get(args.handle)?.sync(args.flags);
        Ok(())
    }

    /// Offset a client passes to `mmap` to map buffer `handle`.
    pub fn mem_map(&self, session: &Session, handle: u32) -> Result<u64> {
        Ok(session.get(handle)?.dma_addr())
    }

    /// Buffer an `mmap` of `len` bytes at `offset` refers to.
    pub fn mmap_target(&self, session: &Session, offset: u64, len: u64) -> Result<Arc<Buffer>> {
        session
            .buffers()
            .into_iter()
            .find(|b| b.dma_addr() == offset && b.size() >= len)
            .ok_or_else(|| {
                NpuError::InvalidArgument(format!("no buffer at {offset:#x} covering {len:#x} bytes"))
            })
    }

    /// Submits a job and, unless it is non-blocking, waits for it.
    ///
    /// While the job is outstanding it holds a power reference, guard pages around the
    /// session's buffers (with IOMMU translation) and the session's imported buffers, which are
    /// synced to the device before the job is queued and back to the CPU once it is done. A
    /// submission that fails validation takes none of them.
    pub fn submit(&self, session: &Session, args: &SubmitArgs) -> Result<SubmitResult> {
        self.engine
            .check_submission(args.flags, args.task_number, args.core_mask)?;
        let task_buffer = session.get(args.task_obj)?;
        let task_base_addr = match args.task_base_addr {
            0 => task_buffer.dma_addr(),
            addr => addr,
        };

        let mut request = JobRequest {
            flags: args.flags,
            timeout: Duration::from_millis(args.timeout_ms as u64),
            core_mask: args.core_mask,
            task_start: args.task_start,
            task_number: args.task_number,
            subcore_task: args.subcore_task,
            task_buffer,
            task_base_addr,
            resources: JobResources::default(),
        };
        self.engine.validate(&request)?;

        let power = self.power.acquire_ref()?;
        let guards = self.iommu.as_ref().map(|iommu| {
            let ranges: Vec<_> = session.buffers().iter().map(|b| b.dma_range()).collect();
            let regions = plan_guard_regions(&ranges, &self.cfg.guard);
            let guards = GuardSet::map(iommu.clone(), self.dma.clone(), &regions, &self.cfg.guard);
            self.stats.add_guard_pages_mapped(guards.len() as u64);
            guards
        });
        let sync_back = session.imported_buffers();
        for buffer in &sync_back {
            buffer.sync(SyncFlags::TO_DEVICE);
        }
        request.resources = JobResources {
            sync_back,
            guards,
            power: Some(power),
        };
        let job = self.engine.submit(request)?;

        if job.flags().contains(JobFlags::NONBLOCK) {
            return Ok(SubmitResult {
                task_counter: 0,
                hw_elapse_time_ns: 0,
                core_mask: job.core_mask(),
            });
        }

        let result = self.engine.wait(&job).map_err(|err| {
            if self.engine.abort(&job, &err) {
                if let Err(reset_err) = self.soft_reset() {
                    warn!(job = job.id(), %reset_err, "soft reset after timeout failed");
                }
            }
            err
        });
        job.release_resources();
        result
    }

    /// Interrupt handler for `core`.
    pub fn handle_irq(&self, core: usize) -> IrqOutcome {
        self.engine.handle_irq(core)
    }

    /// Resets every core, failing the jobs they were running.
    ///
    /// Does nothing when resets are bypassed or one is already in progress.
    pub fn soft_reset(&self) -> Result<()> {
        if self.cfg.bypass_soft_reset {
            info!("soft reset bypassed");
            return Ok(());
        }
        let _resetting = match self.reset_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("soft reset already in progress");
                return Ok(());
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        self.stats.inc_soft_resets();
        warn!(lines = self.reset.line_count(), "soft reset");
        self.engine.begin_soft_reset();
        let result = self.reset_hardware();
        self.engine.fail_running();
        self.engine.end_soft_reset();
        result
    }

    fn reset_hardware(&self) -> Result<()> {
        let _power = self.power.acquire_ref()?;
        let lines = self.reset.line_count();
        let mut first_err = None;
        for line in 0..lines {
            if let Err(err) = self.reset.assert_line(line) {
                warn!(line, %err, "reset assert failed");
                first_err.get_or_insert(err);
            }
        }
        for line in 0..lines {
            if let Err(err) = self.reset.deassert_line(line) {
                warn!(line, %err, "reset deassert failed");
                first_err.get_or_insert(err);
            }
        }
        if let Some(iommu) = &self.iommu {
            revalidate_translation(iommu.as_ref(), self.cores[0].as_ref());
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Stops background work and powers the NPU off. Later calls do nothing.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut sampler) = lock(&self.sampler).take() {
            sampler.stop();
        }
        let outstanding = self.engine.outstanding_jobs();
        if outstanding > 0 {
            warn!(outstanding, "detaching with jobs still queued");
        }
        self.engine.shutdown();
        self.power.shutdown();
        info!("rknpu detached");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("cores", &self.cores.len())
            .field("iommu", &self.iommu.is_some())
            .field("power_refs", &self.power.refcount())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
