//! Job runners: execute pulled jobs off the scheduling thread.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use tracing::{debug, info, warn};

use regards_core::LockOwner;

use super::types::{JobCompletion, JobId, JobOutcome, JobResult, QueuedJob};
use crate::lock::{CancelToken, Canceller, LockService, LockStore, cancellation};

/// Lock owner used for per-job locks.
pub const JOB_LOCK_OWNER: &str = "JobService";

/// Name of the lock guarding one job across scheduler instances.
pub fn job_lock_name(job: &QueuedJob) -> String {
    format!("JOB_{}", job.id)
}

/// Job handler function type.
///
/// The token is cancelled when the job is aborted; long-running handlers
/// should check it and return early.
pub type JobHandler = Arc<dyn Fn(&QueuedJob, &CancelToken) -> JobResult + Send + Sync>;

/// Runs a pulled job asynchronously and reports back on `done`.
///
/// `launch` must not block on the job itself. Exactly one completion is
/// sent per successfully launched job.
pub trait JobRunner: Send + Sync {
    fn launch(&self, job: QueuedJob, done: mpsc::Sender<JobCompletion>)
    -> Result<(), JobRunnerError>;

    /// Request cancellation of a launched job that has not completed yet.
    /// Returns `false` when the runner does not know the job.
    ///
    /// A cancelled job completes with [`JobOutcome::Aborted`].
    fn abort(&self, job_id: JobId) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum JobRunnerError {
    #[error("failed to spawn job thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl<R: JobRunner + ?Sized> JobRunner for Arc<R> {
    fn launch(
        &self,
        job: QueuedJob,
        done: mpsc::Sender<JobCompletion>,
    ) -> Result<(), JobRunnerError> {
        (**self).launch(job, done)
    }

    fn abort(&self, job_id: JobId) -> bool {
        (**self).abort(job_id)
    }
}

/// Runs each job on its own named thread, dispatching on `QueuedJob::kind`.
///
/// Handlers are matched by exact kind, then by `prefix.*` pattern, then by
/// the `*` wildcard. A job with no matching handler fails. Clones share
/// the set of running jobs.
#[derive(Default, Clone)]
pub struct ThreadJobRunner {
    handlers: HashMap<String, JobHandler>,
    running: Arc<Mutex<HashMap<JobId, Canceller>>>,
}

impl ThreadJobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job kind pattern.
    pub fn register_handler<F>(&mut self, kind_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&QueuedJob, &CancelToken) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(kind_pattern.into(), Arc::new(handler));
    }

    pub fn with_handler<F>(mut self, kind_pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&QueuedJob, &CancelToken) -> JobResult + Send + Sync + 'static,
    {
        self.register_handler(kind_pattern, handler);
        self
    }

    /// Number of launched jobs that have not completed yet.
    pub fn running_count(&self) -> usize {
        self.running_jobs().len()
    }

    fn running_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Canceller>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler_for(&self, kind: &str) -> Option<JobHandler> {
        if let Some(h) = self.handlers.get(kind) {
            return Some(h.clone());
        }

        // Longest matching prefix wins, so "storage.copy.*" beats "storage.*"
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = kind.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h.clone());
        if category.is_some() {
            return category;
        }

        self.handlers.get("*").cloned()
    }
}

impl std::fmt::Debug for ThreadJobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<&String> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("ThreadJobRunner")
            .field("handlers", &patterns)
            .finish()
    }
}

impl JobRunner for ThreadJobRunner {
    fn launch(
        &self,
        job: QueuedJob,
        done: mpsc::Sender<JobCompletion>,
    ) -> Result<(), JobRunnerError> {
        let handler = self.handler_for(&job.kind);
        let job_id = job.id;
        let (canceller, cancel) = cancellation();
        self.running_jobs().insert(job_id, canceller);
        let running = self.running.clone();

        let spawned = thread::Builder::new()
            .name(format!("job-{}", job.id))
            .spawn(move || {
                let outcome = match handler {
                    // Aborted between launch and start.
                    _ if cancel.is_cancelled() => {
                        info!(job_id = %job.id, tenant = %job.tenant, "job aborted before start");
                        JobOutcome::Aborted
                    }
                    Some(handler) => run_handler(&handler, &job, &cancel),
                    None => {
                        let error = format!("no handler for job kind: {}", job.kind);
                        warn!(job_id = %job.id, tenant = %job.tenant, error = %error, "no handler for job");
                        JobOutcome::Failed(error)
                    }
                };

                // Dropping the canceller cancels the token, so deregister only
                // once the outcome is settled.
                running
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&job.id);
                debug!(job_id = %job.id, tenant = %job.tenant, outcome = ?outcome, "job finished");

                // The puller may already be gone during shutdown.
                let _ = done.send(JobCompletion {
                    job_id: job.id,
                    tenant: job.tenant,
                    outcome,
                });
            });

        if let Err(e) = spawned {
            self.running_jobs().remove(&job_id);
            return Err(e.into());
        }
        Ok(())
    }

    fn abort(&self, job_id: JobId) -> bool {
        match self.running_jobs().get(&job_id) {
            Some(canceller) => {
                canceller.cancel();
                true
            }
            None => false,
        }
    }
}

fn run_handler(handler: &JobHandler, job: &QueuedJob, cancel: &CancelToken) -> JobOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(job, cancel)));
    if cancel.is_cancelled() {
        info!(job_id = %job.id, tenant = %job.tenant, "job aborted");
        return JobOutcome::Aborted;
    }
    match result {
        Ok(result) => result.into(),
        Err(_) => {
            warn!(job_id = %job.id, tenant = %job.tenant, "job handler panicked");
            JobOutcome::Failed("job handler panicked".to_string())
        }
    }
}

/// Wrap `handler` so it only runs while holding the job's lock.
///
/// A job whose lock is held elsewhere fails without running.
pub fn with_job_lock<S, F>(
    locks: Arc<LockService<S>>,
    expires_in_seconds: u64,
    handler: F,
) -> Result<
    impl Fn(&QueuedJob, &CancelToken) -> JobResult + Send + Sync + 'static,
    regards_core::DomainError,
>
where
    S: LockStore + 'static,
    F: Fn(&QueuedJob, &CancelToken) -> JobResult + Send + Sync + 'static,
{
    let owner = LockOwner::new(JOB_LOCK_OWNER)?;
    Ok(move |job: &QueuedJob, cancel: &CancelToken| {
        let name = job_lock_name(job);
        match locks.try_run_with_lock(&name, &owner, expires_in_seconds, || handler(job, cancel)) {
            Ok(Some(result)) => result,
            Ok(None) => JobResult::Failure(format!("{name} is locked by another instance")),
            Err(e) => JobResult::Failure(e.to_string()),
        }
    })
}
