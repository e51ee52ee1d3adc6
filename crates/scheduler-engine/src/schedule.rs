use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::retry::RetryPolicy;
use crate::types::{JobState, JobStatus, Outcome, Schedule};

/// A parsed cron expression, evaluated in UTC.
///
/// Accepts five fields (`min hour dom month dow`) or six with leading
/// seconds. Day-of-week follows the `cron` crate (1 = Sunday), so names
/// such as `MON-FRI` are the unambiguous spelling.
#[derive(Clone)]
pub struct CronExpr {
    expression: String,
    schedule: CronSchedule,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let fields = trimmed.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {trimmed}"),
            6 => trimmed.to_string(),
            n => {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "cron expression {trimmed:?}: expected 5 or 6 fields, got {n}"
                )))
            }
        };
        let schedule = CronSchedule::from_str(&normalized)
            .map_err(|e| SchedulerError::InvalidSchedule(format!("cron expression {trimmed:?}: {e}")))?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl std::fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CronExpr").field(&self.expression).finish()
    }
}

/// Due time for a job seen for the first time at `now`.
pub fn first_due(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => Some(*at),
        Schedule::Interval { anchor, .. } => Some(anchor.unwrap_or(now)),
        Schedule::Cron(expr) => expr.next_after(now),
    }
}

/// Next regular occurrence after the one scheduled for `scheduled_for` ran
/// at `now`. `None` when the schedule is exhausted.
///
/// Interval jobs stay on the `scheduled_for + k * every` grid: the next slot
/// is `scheduled_for + every`, except that when several slots have already
/// passed they collapse into the latest one (run once, immediately).
pub fn next_occurrence(
    schedule: &Schedule,
    scheduled_for: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { .. } => None,

        Schedule::Interval { every_secs, .. } => {
            let every = Duration::seconds(*every_secs as i64);
            let next = scheduled_for + every;
            if next + every > now {
                return Some(next);
            }
            let every_ms = every.num_milliseconds().max(1);
            let slots = (now - scheduled_for).num_milliseconds() / every_ms;
            warn!(
                skipped = slots - 1,
                "interval job fell behind; coalescing missed occurrences"
            );
            Some(scheduled_for + Duration::milliseconds(slots * every_ms))
        }

        Schedule::Cron(expr) => expr.next_after(now.max(scheduled_for)),
    }
}

/// What to write back after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Reschedule {
        next_due_at: DateTime<Utc>,
        scheduled_for: DateTime<Utc>,
        attempt_count: u32,
        status: JobStatus,
    },
    /// Drop the instance state (one-shot finished, or schedule exhausted).
    Remove { status: JobStatus },
}

/// Decide the follow-up for `state` after `outcome` at `now`.
///
/// Failures retry at `now + backoff` while the policy allows; once it does
/// not, one-shot jobs are removed and recurring jobs resume their normal
/// schedule with the retry counter reset.
pub fn plan(
    schedule: &Schedule,
    retry: &RetryPolicy,
    state: &JobState,
    outcome: &Outcome,
    now: DateTime<Utc>,
) -> Plan {
    if !outcome.is_success() && retry.should_retry(state.attempt_count) {
        let retry_number = state.attempt_count + 1;
        let delay = Duration::from_std(retry.delay_for(retry_number)).unwrap_or(Duration::MAX);
        return Plan::Reschedule {
            next_due_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
            scheduled_for: state.scheduled_for,
            attempt_count: retry_number,
            status: JobStatus::Failed,
        };
    }

    let final_status = if outcome.is_success() {
        JobStatus::Succeeded
    } else {
        JobStatus::Failed
    };
    match next_occurrence(schedule, state.scheduled_for, now) {
        Some(next) => Plan::Reschedule {
            next_due_at: next,
            scheduled_for: next,
            attempt_count: 0,
            status: JobStatus::Idle,
        },
        None => Plan::Remove {
            status: final_status,
        },
    }
}
