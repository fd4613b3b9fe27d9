//! Submissions and their aggregated status

use crate::job::{JobId, JobStatus, SubmissionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregated status of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    /// Jobs created or waiting for a slot
    Pending,
    /// Some job waits on inputs and nothing runs
    Blocked,
    /// Some job is running
    Running,
    /// Some job was canceled and nothing is left to run
    Canceled,
    /// Some job failed
    Failed,
    /// Every job completed, skipped or was abandoned
    Completed,
}

impl SubmissionStatus {
    /// Aggregate job statuses
    ///
    /// Rules apply in order: failed, canceled, blocked, running, pending,
    /// completed. `CREATED` counts as pending.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut failed = false;
        let mut canceled = false;
        let mut blocked = false;
        let mut running = false;
        let mut pending = false;

        for status in statuses {
            match status {
                JobStatus::Failed => failed = true,
                JobStatus::Canceled => canceled = true,
                JobStatus::Blocked => blocked = true,
                JobStatus::Running => running = true,
                JobStatus::Pending | JobStatus::Created => pending = true,
                JobStatus::Completed | JobStatus::Skipped | JobStatus::Abandoned => {}
            }
        }

        if failed {
            Self::Failed
        } else if canceled && !(running || pending || blocked) {
            Self::Canceled
        } else if blocked && !running {
            Self::Blocked
        } else if running {
            Self::Running
        } else if pending {
            Self::Pending
        } else {
            Self::Completed
        }
    }

    /// No job of the submission can still change
    ///
    /// `FAILED` only counts once nothing else is live, so check the jobs
    /// themselves when that matters.
    #[inline]
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Blocked => "BLOCKED",
            Self::Running => "RUNNING",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

/// Jobs created by one submit call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    id: SubmissionId,
    entity_id: String,
    job_ids: Vec<JobId>,
    status: SubmissionStatus,
    creation_time: DateTime<Utc>,
}

impl Submission {
    pub(crate) fn new(id: SubmissionId, entity_id: String, job_ids: Vec<JobId>) -> Self {
        Self {
            id,
            entity_id,
            job_ids,
            status: SubmissionStatus::Pending,
            creation_time: Utc::now(),
        }
    }

    /// Submission id
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Submittable the jobs were created from
    #[inline]
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Jobs in declaration order
    #[inline]
    #[must_use]
    pub fn job_ids(&self) -> &[JobId] {
        &self.job_ids
    }

    /// Last computed status
    #[inline]
    #[must_use]
    pub fn status(&self) -> SubmissionStatus {
        self.status
    }

    /// Creation time
    #[inline]
    #[must_use]
    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    /// Store a recomputed status; returns whether it changed
    pub(crate) fn set_status(&mut self, status: SubmissionStatus) -> bool {
        let changed = self.status != status;
        self.status = status;
        changed
    }
}
