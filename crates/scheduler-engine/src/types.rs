use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::retry::RetryPolicy;
use crate::schedule::CronExpr;

/// Defines when and how often a job should run.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Run exactly once at the given UTC instant (immediately if already past).
    Once { at: DateTime<Utc> },

    /// Run every `every_secs`, on the grid `anchor + k * every_secs`.
    /// Without an anchor the grid starts at first registration.
    Interval {
        every_secs: u64,
        anchor: Option<DateTime<Utc>>,
    },

    /// Run at the times matched by a UTC cron expression.
    Cron(CronExpr),
}

impl Schedule {
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Once { .. } => "one-shot",
            Schedule::Interval { .. } => "fixed-interval",
            Schedule::Cron(_) => "cron-like",
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Schedule::Once { .. })
    }
}

/// Static description of a job, fixed for the lifetime of the process.
///
/// Unset retry/timeout fields take the dispatcher defaults at registration.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub key: String,
    pub schedule: Schedule,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
}

impl JobDefinition {
    pub fn new(key: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            key: key.into(),
            schedule,
            retry: None,
            timeout: None,
        }
    }

    pub fn once(key: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(key, Schedule::Once { at })
    }

    pub fn interval(key: impl Into<String>, every: Duration) -> Self {
        Self::new(
            key,
            Schedule::Interval {
                every_secs: every.as_secs(),
                anchor: None,
            },
        )
    }

    pub fn cron(key: impl Into<String>, expression: &str) -> Result<Self> {
        Ok(Self::new(key, Schedule::Cron(CronExpr::parse(expression)?)))
    }

    /// Pin an interval job's grid to `anchor`. No-op for other kinds.
    pub fn anchored_at(mut self, at: DateTime<Utc>) -> Self {
        if let Schedule::Interval { anchor, .. } = &mut self.schedule {
            *anchor = Some(at);
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() || self.key.chars().any(char::is_whitespace) {
            return Err(SchedulerError::InvalidSchedule(format!(
                "job key {:?} must be non-empty and contain no whitespace",
                self.key
            )));
        }
        if let Schedule::Interval { every_secs: 0, .. } = self.schedule {
            return Err(SchedulerError::InvalidSchedule(format!(
                "job {}: interval must be at least one second",
                self.key
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(SchedulerError::InvalidSchedule(format!(
                "job {}: timeout must be positive",
                self.key
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for next_due_at.
    Idle,
    /// Claimed by an instance; handler not started yet.
    Leased,
    /// Handler executing.
    Running,
    /// Last attempt failed; a retry is scheduled.
    Failed,
    /// Finished for good (one-shot tombstones only).
    Succeeded,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Leased => "leased",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Succeeded => "succeeded",
        };
        write!(f, "{s}")
    }
}

/// How one execution attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { reason: String },
    TimedOut,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    /// The error this outcome represents, if any.
    pub fn as_error(&self, job: &str, timeout: Duration) -> Option<SchedulerError> {
        match self {
            Outcome::Succeeded => None,
            Outcome::Failed { reason } => Some(SchedulerError::HandlerFailure {
                job: job.to_string(),
                reason: reason.clone(),
            }),
            Outcome::TimedOut => Some(SchedulerError::HandlerTimeout {
                job: job.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Failed { .. } => write!(f, "failed"),
            Outcome::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Persisted summary of the most recent attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastResult {
    pub outcome: Outcome,
    /// 1-based attempt number within the occurrence.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub instance_id: String,
}

/// Persisted per-job state. Only ever changed through guarded store commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub key: String,
    /// When the job may next be claimed (a retry time while retrying).
    pub next_due_at: DateTime<Utc>,
    /// The occurrence this state belongs to; retries keep it, so recurring
    /// jobs advance from it rather than from the retry time.
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Retries already scheduled for the current occurrence.
    pub attempt_count: u32,
    pub last_result: Option<LastResult>,
}

impl JobState {
    pub fn new(key: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            next_due_at: due_at,
            scheduled_for: due_at,
            status: JobStatus::Idle,
            lease_owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            last_result: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due_at <= now
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// One record per execution attempt, handed to the observability sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub job_key: String,
    pub attempt: u32,
    pub instance_id: String,
    pub outcome: Outcome,
    pub duration: Duration,
    /// True when fencing rejected the result (lease lost before commit).
    pub discarded: bool,
}
