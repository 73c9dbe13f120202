//! Multi-tenant job puller.
//!
//! A dedicated thread repeatedly asks the [`TenantJobAllocator`] which tenant
//! may launch next, pulls that tenant's next job from the [`JobSource`] and
//! hands it to the [`JobRunner`]. Completions flow back over a channel and
//! free the tenant's slot.
//!
//! The allocator always sees the whole active roster. A tenant in maintenance
//! keeps its queue and running count; it is passed over when selected.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use regards_core::{TenantJobAllocator, TenantName};

use super::queue::JobSource;
use super::runner::JobRunner;
use super::types::{JobCompletion, JobId, JobOutcome, QueuedJob};
use crate::tenants::TenantResolver;

pub const DEFAULT_CAPACITY: NonZeroUsize = NonZeroUsize::new(10).unwrap();

/// Job puller configuration.
#[derive(Debug, Clone)]
pub struct JobPullerConfig {
    /// Thread name, also used in logs
    pub name: String,
    /// Total job slots shared by all tenants
    pub capacity: NonZeroUsize,
    /// Idle wait between scans when nothing could be launched
    pub scan_delay: Duration,
}

impl Default for JobPullerConfig {
    fn default() -> Self {
        Self {
            name: "job-puller".to_string(),
            capacity: DEFAULT_CAPACITY,
            scan_delay: Duration::from_secs(1),
        }
    }
}

impl JobPullerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_scan_delay(mut self, scan_delay: Duration) -> Self {
        self.scan_delay = scan_delay;
        self
    }
}

/// Puller runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PullerStats {
    pub ticks: u64,
    pub idle_ticks: u64,
    pub jobs_launched: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_expired: u64,
    pub jobs_aborted: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
enum Control {
    Shutdown,
    Abort(JobId),
}

/// Handle to control a running puller.
///
/// Dropping the handle also stops the puller, without waiting for it.
#[derive(Debug)]
pub struct JobPullerHandle {
    control: mpsc::Sender<Control>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PullerStats>>,
}

impl JobPullerHandle {
    /// Stop pulling and wait for the puller thread to exit.
    ///
    /// Jobs already launched keep running on their own threads.
    pub fn shutdown(mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Ask the puller to abort a job.
    ///
    /// A queued job is marked aborted and never pulled. A running job has its
    /// cancel token set and is settled as aborted when its handler returns.
    /// Jobs that already finished are left as they are.
    pub fn abort(&self, job_id: JobId) {
        let _ = self.control.send(Control::Abort(job_id));
    }

    pub fn stats(&self) -> PullerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Pulls jobs tenant by tenant, fair-sharing a fixed number of slots.
pub struct JobPuller<R, S, X> {
    resolver: R,
    source: S,
    runner: X,
}

impl<R, S, X> JobPuller<R, S, X>
where
    R: TenantResolver + 'static,
    S: JobSource + 'static,
    X: JobRunner + 'static,
{
    pub fn new(resolver: R, source: S, runner: X) -> Self {
        Self {
            resolver,
            source,
            runner,
        }
    }

    /// Spawn the puller in a background thread.
    pub fn spawn(self, config: JobPullerConfig) -> std::io::Result<JobPullerHandle> {
        let (control_tx, control_rx) = mpsc::channel::<Control>();
        let stats = Arc::new(Mutex::new(PullerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || puller_loop(self, config, control_rx, stats_clone))?;

        Ok(JobPullerHandle {
            control: control_tx,
            join: Some(join),
            stats,
        })
    }

    /// One scheduling pass. Returns `true` when a job was launched or
    /// settled, meaning another pass should follow right away.
    fn tick(
        &self,
        allocator: &mut TenantJobAllocator,
        done: &mpsc::Sender<JobCompletion>,
        stats: &Mutex<PullerStats>,
    ) -> bool {
        let tenants: Vec<TenantName> = self.resolver.active_tenants();

        // Each tenant is examined at most once per pass.
        for _ in 0..tenants.len() {
            let Some(tenant) = allocator.next(&tenants) else {
                debug!("every tenant is at its job limit");
                return false;
            };

            if self.resolver.is_in_maintenance(&tenant) {
                warn!(tenant = %tenant, "tenant is in maintenance, its jobs are not pulled");
                continue;
            }

            match self.source.next_queued_job(&tenant) {
                Ok(Some(job)) => {
                    self.start(job, allocator, done, stats);
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(tenant = %tenant, error = %e, "failed to pull next job");
                }
            }
        }

        false
    }

    fn start(
        &self,
        job: QueuedJob,
        allocator: &mut TenantJobAllocator,
        done: &mpsc::Sender<JobCompletion>,
        stats: &Mutex<PullerStats>,
    ) {
        let job_id = job.id;
        let tenant = job.tenant.clone();

        if job.is_expired_at(Utc::now()) {
            info!(job_id = %job_id, tenant = %tenant, "expiration date reached, job not launched");
            self.settle(
                JobCompletion {
                    job_id,
                    tenant,
                    outcome: JobOutcome::Expired,
                },
                stats,
            );
            return;
        }

        if !allocator.acquire(&tenant) {
            warn!(tenant = %tenant, "tenant has no allocation queue, its job slot is not counted");
        }
        match self.runner.launch(job, done.clone()) {
            Ok(()) => {
                debug!(job_id = %job_id, tenant = %tenant, "job launched");
                update(stats, |s| {
                    s.jobs_launched += 1;
                    s.current_running += 1;
                });
            }
            Err(e) => {
                error!(job_id = %job_id, tenant = %tenant, error = %e, "failed to launch job");
                release(allocator, &tenant);
                self.settle(
                    JobCompletion {
                        job_id,
                        tenant,
                        outcome: JobOutcome::Failed(e.to_string()),
                    },
                    stats,
                );
            }
        }
    }

    fn drain_completions(
        &self,
        done: &mpsc::Receiver<JobCompletion>,
        allocator: &mut TenantJobAllocator,
        stats: &Mutex<PullerStats>,
    ) {
        while let Ok(completion) = done.try_recv() {
            release(allocator, &completion.tenant);
            update(stats, |s| s.current_running = s.current_running.saturating_sub(1));
            self.settle(completion, stats);
        }
    }

    /// Record a final outcome with the source.
    fn settle(&self, completion: JobCompletion, stats: &Mutex<PullerStats>) {
        if let Err(e) = self.source.record_outcome(&completion) {
            error!(job_id = %completion.job_id, tenant = %completion.tenant, error = %e, "failed to record job outcome");
        }
        update(stats, |s| match completion.outcome {
            JobOutcome::Succeeded => s.jobs_completed += 1,
            JobOutcome::Failed(_) => s.jobs_failed += 1,
            JobOutcome::Expired => s.jobs_expired += 1,
            JobOutcome::Aborted => s.jobs_aborted += 1,
        });
    }

    fn abort(&self, job_id: JobId, stats: &Mutex<PullerStats>) {
        match self.source.abort(job_id) {
            Ok(true) => {
                info!(job_id = %job_id, "queued job aborted");
                update(stats, |s| s.jobs_aborted += 1);
            }
            Ok(false) if self.runner.abort(job_id) => {
                info!(job_id = %job_id, "abort requested for running job");
            }
            Ok(false) => {
                debug!(job_id = %job_id, "job is neither queued nor running here, abort ignored");
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to abort job");
            }
        }
    }
}

/// Free a slot. The tenant's queue can be gone if the roster changed size
/// while the job ran, in which case the slot is already forgotten.
fn release(allocator: &mut TenantJobAllocator, tenant: &TenantName) {
    if !allocator.release(tenant) {
        warn!(tenant = %tenant, "completed job has no allocation queue to release");
    }
}

fn puller_loop<R, S, X>(
    puller: JobPuller<R, S, X>,
    config: JobPullerConfig,
    control_rx: mpsc::Receiver<Control>,
    stats: Arc<Mutex<PullerStats>>,
) where
    R: TenantResolver + 'static,
    S: JobSource + 'static,
    X: JobRunner + 'static,
{
    info!(puller = %config.name, capacity = config.capacity.get(), "job puller started");
    let start_time = Instant::now();
    let (done_tx, done_rx) = mpsc::channel::<JobCompletion>();
    let mut allocator = TenantJobAllocator::new(config.capacity);

    'pulling: loop {
        loop {
            match control_rx.try_recv() {
                Ok(Control::Abort(job_id)) => puller.abort(job_id, &stats),
                Ok(Control::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => break 'pulling,
                Err(mpsc::TryRecvError::Empty) => break,
            }
        }

        puller.drain_completions(&done_rx, &mut allocator, &stats);
        let progressed = puller.tick(&mut allocator, &done_tx, &stats);

        update(&stats, |s| {
            s.ticks += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
            if !progressed {
                s.idle_ticks += 1;
            }
        });

        if !progressed {
            match control_rx.recv_timeout(config.scan_delay) {
                Ok(Control::Abort(job_id)) => puller.abort(job_id, &stats),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(Control::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    info!(puller = %config.name, "job puller stopped");
}

fn update(stats: &Mutex<PullerStats>, f: impl FnOnce(&mut PullerStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}
