//! Job source abstraction and in-memory queue.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regards_core::TenantName;

use super::types::{JobCompletion, JobId, JobStatus, QueuedJob};

/// Where the scheduler pulls jobs from.
pub trait JobSource: Send + Sync {
    /// Take the highest-priority queued job of `tenant` and mark it `ToBeRun`.
    /// Returns `None` when the tenant has nothing queued.
    fn next_queued_job(&self, tenant: &TenantName) -> Result<Option<QueuedJob>, JobSourceError>;

    /// Record the final outcome of a pulled job.
    fn record_outcome(&self, completion: &JobCompletion) -> Result<(), JobSourceError>;

    /// Abort a job that has not been pulled yet.
    ///
    /// Returns `false` when the job already left the `Queued` state; pulled
    /// jobs are aborted through their runner.
    fn abort(&self, job_id: JobId) -> Result<bool, JobSourceError>;
}

/// Job source error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobSourceError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<S: JobSource + ?Sized> JobSource for Arc<S> {
    fn next_queued_job(&self, tenant: &TenantName) -> Result<Option<QueuedJob>, JobSourceError> {
        (**self).next_queued_job(tenant)
    }

    fn record_outcome(&self, completion: &JobCompletion) -> Result<(), JobSourceError> {
        (**self).record_outcome(completion)
    }

    fn abort(&self, job_id: JobId) -> Result<bool, JobSourceError> {
        (**self).abort(job_id)
    }
}

/// Queue statistics for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub to_be_run: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
    pub aborted: usize,
}

#[derive(Debug)]
struct Entry {
    /// Insertion order, breaks priority ties FIFO.
    seq: u64,
    job: QueuedJob,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<JobId, Entry>,
}

/// In-memory job queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    inner: RwLock<Inner>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Add a job in `Queued` state.
    pub fn enqueue(&self, mut job: QueuedJob) -> Result<JobId, JobSourceError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobSourceError::AlreadyExists(job.id));
        }
        job.set_status(JobStatus::Queued);
        let id = job.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(id, Entry { seq, job });
        Ok(id)
    }

    pub fn get(&self, job_id: JobId) -> Result<Option<QueuedJob>, JobSourceError> {
        let inner = self.read()?;
        Ok(inner.jobs.get(&job_id).map(|e| e.job.clone()))
    }

    /// Number of jobs still waiting to be pulled, all tenants included.
    pub fn len(&self) -> usize {
        self.read()
            .map(|inner| {
                inner
                    .jobs
                    .values()
                    .filter(|e| e.job.status == JobStatus::Queued)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, tenant: &TenantName) -> Result<QueueStats, JobSourceError> {
        let inner = self.read()?;
        let mut stats = QueueStats::default();
        for entry in inner.jobs.values().filter(|e| &e.job.tenant == tenant) {
            match &entry.job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::ToBeRun => stats.to_be_run += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::Expired => stats.expired += 1,
                JobStatus::Aborted => stats.aborted += 1,
            }
        }
        Ok(stats)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, JobSourceError> {
        self.inner
            .read()
            .map_err(|_| JobSourceError::Storage("job queue lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, JobSourceError> {
        self.inner
            .write()
            .map_err(|_| JobSourceError::Storage("job queue lock poisoned".to_string()))
    }
}

impl JobSource for InMemoryJobQueue {
    fn next_queued_job(&self, tenant: &TenantName) -> Result<Option<QueuedJob>, JobSourceError> {
        let mut inner = self.write()?;

        let next = inner
            .jobs
            .values()
            .filter(|e| &e.job.tenant == tenant && e.job.status == JobStatus::Queued)
            .min_by_key(|e| (std::cmp::Reverse(e.job.priority), e.seq))
            .map(|e| e.job.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let entry = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobSourceError::NotFound(job_id))?;
        entry.job.set_status(JobStatus::ToBeRun);
        Ok(Some(entry.job.clone()))
    }

    fn record_outcome(&self, completion: &JobCompletion) -> Result<(), JobSourceError> {
        let mut inner = self.write()?;
        let entry = inner
            .jobs
            .get_mut(&completion.job_id)
            .ok_or(JobSourceError::NotFound(completion.job_id))?;
        entry.job.set_status(completion.outcome.clone().into_status());
        Ok(())
    }

    fn abort(&self, job_id: JobId) -> Result<bool, JobSourceError> {
        let mut inner = self.write()?;
        let entry = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobSourceError::NotFound(job_id))?;
        if entry.job.status != JobStatus::Queued {
            return Ok(false);
        }
        entry.job.set_status(JobStatus::Aborted);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobOutcome;

    fn tenant(name: &str) -> TenantName {
        TenantName::new(name).unwrap()
    }

    fn job(t: &str, priority: i32) -> QueuedJob {
        QueuedJob::new(tenant(t), "test", serde_json::json!({})).with_priority(priority)
    }

    #[test]
    fn enqueue_and_pull() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(job("A", 0)).unwrap();
        assert_eq!(queue.len(), 1);

        let pulled = queue.next_queued_job(&tenant("A")).unwrap().unwrap();
        assert_eq!(pulled.id, id);
        assert_eq!(pulled.status, JobStatus::ToBeRun);
        assert!(queue.is_empty());

        // No more jobs
        assert!(queue.next_queued_job(&tenant("A")).unwrap().is_none());
    }

    #[test]
    fn highest_priority_first_then_fifo() {
        let queue = InMemoryJobQueue::new();
        let low = queue.enqueue(job("A", 1)).unwrap();
        let high_first = queue.enqueue(job("A", 5)).unwrap();
        let high_second = queue.enqueue(job("A", 5)).unwrap();

        let order: Vec<JobId> = std::iter::from_fn(|| queue.next_queued_job(&tenant("A")).unwrap())
            .map(|j| j.id)
            .collect();
        assert_eq!(order, vec![high_first, high_second, low]);
    }

    #[test]
    fn tenants_are_isolated() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(job("A", 0)).unwrap();

        assert!(queue.next_queued_job(&tenant("B")).unwrap().is_none());
        assert!(queue.next_queued_job(&tenant("A")).unwrap().is_some());
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let queue = InMemoryJobQueue::new();
        let j = job("A", 0);
        queue.enqueue(j.clone()).unwrap();
        assert_eq!(queue.enqueue(j.clone()), Err(JobSourceError::AlreadyExists(j.id)));
    }

    #[test]
    fn aborted_jobs_are_not_pulled() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(job("A", 0)).unwrap();

        assert!(queue.abort(id).unwrap());
        assert!(queue.next_queued_job(&tenant("A")).unwrap().is_none());
        assert!(!queue.abort(id).unwrap(), "already aborted");
    }

    #[test]
    fn outcome_is_recorded() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(job("A", 0)).unwrap();
        queue.next_queued_job(&tenant("A")).unwrap();

        queue
            .record_outcome(&JobCompletion {
                job_id: id,
                tenant: tenant("A"),
                outcome: JobOutcome::Failed("boom".to_string()),
            })
            .unwrap();

        let stats = queue.stats(&tenant("A")).unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 0);
    }
}
