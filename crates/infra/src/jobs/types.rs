//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use regards_core::TenantName;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a slot
    Queued,
    /// Pulled by the scheduler and handed to a runner
    ToBeRun,
    /// Completed successfully
    Succeeded,
    /// Handler reported a failure
    Failed { error: String },
    /// Expiration date reached before the job could run
    Expired,
    /// Aborted before or while running
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed { .. } | JobStatus::Expired | JobStatus::Aborted
        )
    }
}

/// A tenant-scoped background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub tenant: TenantName,
    /// Routing key for handler selection (e.g. `"storage.copy"`)
    pub kind: String,
    /// Higher runs first within a tenant
    pub priority: i32,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Past this instant the job is no longer run
    pub expires_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    pub fn new(tenant: TenantName, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant,
            kind: kind.into(),
            priority: 0,
            payload,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Result returned by a job handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Failure(String),
}

/// Final outcome reported to the scheduler once a pulled job is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    Expired,
    Aborted,
}

impl JobOutcome {
    pub fn into_status(self) -> JobStatus {
        match self {
            JobOutcome::Succeeded => JobStatus::Succeeded,
            JobOutcome::Failed(error) => JobStatus::Failed { error },
            JobOutcome::Expired => JobStatus::Expired,
            JobOutcome::Aborted => JobStatus::Aborted,
        }
    }
}

impl From<JobResult> for JobOutcome {
    fn from(result: JobResult) -> Self {
        match result {
            JobResult::Success => JobOutcome::Succeeded,
            JobResult::Failure(error) => JobOutcome::Failed(error),
        }
    }
}

/// Completion notice sent from a runner back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub job_id: JobId,
    pub tenant: TenantName,
    pub outcome: JobOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantName {
        TenantName::new("project-1").unwrap()
    }

    #[test]
    fn new_job_is_queued() {
        let job = QueuedJob::new(tenant(), "storage.copy", serde_json::json!({"file": "a"}));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 0);
        assert!(!job.status.is_terminal());
    }

    #[test]
    fn expiration_check() {
        let now = Utc::now();
        let job = QueuedJob::new(tenant(), "x", serde_json::json!({}))
            .expiring_at(now - chrono::Duration::seconds(1));
        assert!(job.is_expired_at(now));

        let job = QueuedJob::new(tenant(), "x", serde_json::json!({}));
        assert!(!job.is_expired_at(now));
    }

    #[test]
    fn outcome_maps_to_terminal_status() {
        assert_eq!(JobOutcome::Succeeded.into_status(), JobStatus::Succeeded);
        assert_eq!(
            JobOutcome::from(JobResult::Failure("disk full".into())).into_status(),
            JobStatus::Failed {
                error: "disk full".into()
            }
        );
        assert!(JobOutcome::Expired.into_status().is_terminal());
        assert_eq!(JobOutcome::Aborted.into_status(), JobStatus::Aborted);
    }
}
