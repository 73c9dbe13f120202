//! Tenant-fair background job pulling.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped and prioritized
//! - A fixed number of job slots is shared between tenants round-robin
//! - Jobs past their expiration date are settled without running
//! - Tenants in maintenance are left alone until maintenance ends
//! - Queued and running jobs can be aborted; running handlers see a cancel token
//!
//! ## Components
//!
//! - `QueuedJob`: job abstraction with payload and metadata
//! - `JobSource`: where jobs are pulled from (`InMemoryJobQueue` for tests/dev)
//! - `JobRunner`: runs a pulled job and reports its outcome (`ThreadJobRunner`)
//! - `JobPuller`: the scheduling thread tying them together

pub mod puller;
pub mod queue;
pub mod runner;
pub mod types;

pub use puller::{JobPuller, JobPullerConfig, JobPullerHandle, PullerStats};
pub use queue::{InMemoryJobQueue, JobSource, JobSourceError, QueueStats};
pub use runner::{
    JOB_LOCK_OWNER, JobHandler, JobRunner, JobRunnerError, ThreadJobRunner, job_lock_name,
    with_job_lock,
};
pub use types::{JobCompletion, JobId, JobOutcome, JobResult, JobStatus, QueuedJob};
