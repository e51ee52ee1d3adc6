//! Schedule Store: durable due times and per-job state on top of the
//! store adapter.
//!
//! Every mutation is a single guarded [`Transaction`]: the state document
//! and its due-set entry always move together.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scheduler_store::{Commit, Guard, Store, Transaction, Write};
use tracing::{error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::keys::Keyspace;
use crate::lock::{fenced, Lease};
use crate::recorder::ExecutionRecorder;
use crate::registry::RegisteredJob;
use crate::schedule::{first_due, plan, Plan};
use crate::types::{JobState, JobStatus, LastResult};

/// State document plus the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: JobState,
    pub version: u64,
}

pub(crate) async fn read_state(
    store: &dyn Store,
    keys: &Keyspace,
    job: &str,
) -> Result<Option<StateSnapshot>> {
    match store.get(&keys.state(job)).await? {
        Some(doc) => Ok(Some(StateSnapshot {
            state: JobState::from_json(&doc.value)?,
            version: doc.version,
        })),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First sighting: state created, due at the given time.
    Created { due_at: DateTime<Utc> },
    /// Another process (or a previous run) already created it.
    Existing,
    /// One-shot job that already finished; it will not run again.
    Retired,
    /// The schedule has no future occurrence.
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Leased/running states whose lease had lapsed, reset to idle.
    pub reset: usize,
    /// Due-set entries repaired (or states recreated).
    pub reindexed: usize,
    /// Idle jobs already past due by more than the threshold.
    pub overdue: usize,
}

#[derive(Clone)]
pub struct ScheduleStore {
    store: Arc<dyn Store>,
    keys: Keyspace,
    recorder: ExecutionRecorder,
}

impl ScheduleStore {
    pub fn new(store: Arc<dyn Store>, keys: Keyspace, recorder: ExecutionRecorder) -> Self {
        Self {
            store,
            keys,
            recorder,
        }
    }

    pub async fn load(&self, job: &str) -> Result<Option<StateSnapshot>> {
        read_state(self.store.as_ref(), &self.keys, job).await
    }

    /// Create the instance state for `job` unless it exists or was retired.
    pub async fn register(&self, job: &RegisteredJob, now: DateTime<Utc>) -> Result<Registration> {
        let key = job.key();
        let Some(due_at) = first_due(&job.definition.schedule, now) else {
            warn!(job = %key, "schedule has no future occurrence; not registering");
            return Ok(Registration::Exhausted);
        };

        let txn = Transaction::new()
            .guard(Guard::Absent(self.keys.state(key)))
            .guard(Guard::Absent(self.keys.retired(key)))
            .write(Write::Put {
                key: self.keys.state(key),
                value: JobState::new(key, due_at).to_json()?,
            })
            .write(Write::ZAdd {
                set: self.keys.due_set(),
                member: key.to_string(),
                score: due_at.timestamp_millis(),
            });

        match self.store.commit(txn).await? {
            Commit::Applied => {
                info!(job = %key, kind = job.definition.schedule.kind(), %due_at, "job state created");
                Ok(Registration::Created { due_at })
            }
            Commit::Conflict if self.store.get(&self.keys.retired(key)).await?.is_some() => {
                Ok(Registration::Retired)
            }
            Commit::Conflict => Ok(Registration::Existing),
        }
    }

    /// Job keys due at or before `now`, earliest first, ties by key.
    pub async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        self.due_page(now, 0, limit).await
    }

    /// Like [`due_jobs`](Self::due_jobs), skipping the first `offset` keys.
    pub async fn due_page(&self, now: DateTime<Utc>, offset: usize, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .store
            .due_before(&self.keys.due_set(), now.timestamp_millis(), offset, limit)
            .await?)
    }

    /// Record `result` and move the job to its next due time (or remove it),
    /// all under `lease`. Returns the new due time, `None` when removed.
    ///
    /// With `release = false` the lease is left to expire on its own TTL.
    /// Fails with `LeaseLost` if the lease lapsed or the state moved on.
    pub async fn schedule_next(
        &self,
        lease: &Lease,
        job: &RegisteredJob,
        state: &JobState,
        result: &LastResult,
        now: DateTime<Utc>,
        release: bool,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = job.key();
        let mut next = state.clone();
        next.last_result = Some(result.clone());
        if release {
            next.lease_owner = None;
            next.lease_expires_at = None;
        }

        let mut txn = fenced(&self.keys, lease).write(self.recorder.result_write(key, result)?);
        let new_due = match plan(&job.definition.schedule, &job.retry, state, &result.outcome, now) {
            Plan::Reschedule {
                next_due_at,
                scheduled_for,
                attempt_count,
                status,
            } => {
                next.next_due_at = next_due_at;
                next.scheduled_for = scheduled_for;
                next.attempt_count = attempt_count;
                next.status = status;
                txn = txn
                    .write(Write::Put {
                        key: self.keys.state(key),
                        value: next.to_json()?,
                    })
                    .write(Write::ZAdd {
                        set: self.keys.due_set(),
                        member: key.to_string(),
                        score: next_due_at.timestamp_millis(),
                    });
                Some(next_due_at)
            }
            Plan::Remove { status } => {
                next.status = status;
                txn = txn.extend_writes(self.removal_writes(key, &next)?);
                None
            }
        };
        if release {
            txn = txn.write(Write::Delete {
                key: self.keys.lease(key),
            });
        }

        match self.store.commit(txn).await? {
            Commit::Applied => Ok(new_due),
            Commit::Conflict => Err(SchedulerError::LeaseLost {
                job: key.to_string(),
            }),
        }
    }

    /// Remove an idle job for good, leaving a retired record so it is not
    /// recreated at the next startup. False if it is missing or currently leased.
    pub async fn mark_removed(&self, job: &str, status: JobStatus) -> Result<bool> {
        let Some(snapshot) = self.load(job).await? else {
            return Ok(false);
        };
        let mut state = snapshot.state;
        state.status = status;
        state.lease_owner = None;
        state.lease_expires_at = None;

        let txn = Transaction::new()
            .guard(Guard::Absent(self.keys.lease(job)))
            .guard(Guard::Version {
                key: self.keys.state(job),
                expected: Some(snapshot.version),
            })
            .extend_writes(self.removal_writes(job, &state)?);
        let removed = self.store.commit(txn).await?.is_applied();
        if removed {
            info!(job = %job, %status, "job removed");
        }
        Ok(removed)
    }

    fn removal_writes(&self, job: &str, final_state: &JobState) -> Result<Vec<Write>> {
        Ok(vec![
            Write::Delete {
                key: self.keys.state(job),
            },
            Write::ZRem {
                set: self.keys.due_set(),
                member: job.to_string(),
            },
            Write::Put {
                key: self.keys.retired(job),
                value: final_state.to_json()?,
            },
        ])
    }

    /// Repair what a crashed instance may have left behind:
    /// - leased/running states whose lease key has expired go back to idle
    ///   with their due time untouched, so the next poll picks them up;
    /// - due-set scores that disagree with `next_due_at` are rewritten;
    /// - missing states of registered jobs are recreated.
    pub async fn recover(
        &self,
        jobs: &[Arc<RegisteredJob>],
        now: DateTime<Utc>,
        overdue_after: Duration,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let overdue_after = chrono::Duration::from_std(overdue_after).unwrap_or(chrono::Duration::MAX);

        for job in jobs {
            match self.recover_one(job, now, overdue_after, &mut report).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => error!(job = %job.key(), error = %e, "recovery skipped job"),
            }
        }
        Ok(report)
    }

    async fn recover_one(
        &self,
        job: &RegisteredJob,
        now: DateTime<Utc>,
        overdue_after: chrono::Duration,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let key = job.key();
        let Some(snapshot) = self.load(key).await? else {
            if let Registration::Created { .. } = self.register(job, now).await? {
                report.reindexed += 1;
            }
            return Ok(());
        };
        let state = snapshot.state;
        let state_key = self.keys.state(key);
        let lease_key = self.keys.lease(key);
        let in_flight = matches!(state.status, JobStatus::Leased | JobStatus::Running);

        if in_flight {
            if self.store.get_value(&lease_key).await?.is_some() {
                return Ok(());
            }
            let mut idle = state.clone();
            idle.status = JobStatus::Idle;
            idle.lease_owner = None;
            idle.lease_expires_at = None;
            let txn = Transaction::new()
                .guard(Guard::Absent(lease_key))
                .guard(Guard::Version {
                    key: state_key.clone(),
                    expected: Some(snapshot.version),
                })
                .write(Write::Put {
                    key: state_key,
                    value: idle.to_json()?,
                })
                .write(Write::ZAdd {
                    set: self.keys.due_set(),
                    member: key.to_string(),
                    score: idle.next_due_at.timestamp_millis(),
                });
            if self.store.commit(txn).await?.is_applied() {
                warn!(job = %key, owner = ?state.lease_owner, "lease holder vanished; job reset to idle");
                report.reset += 1;
            }
            return Ok(());
        }

        let due_ms = state.next_due_at.timestamp_millis();
        if self.store.score(&self.keys.due_set(), key).await? != Some(due_ms) {
            let txn = Transaction::new()
                .guard(Guard::Version {
                    key: state_key,
                    expected: Some(snapshot.version),
                })
                .write(Write::ZAdd {
                    set: self.keys.due_set(),
                    member: key.to_string(),
                    score: due_ms,
                });
            if self.store.commit(txn).await?.is_applied() {
                warn!(job = %key, "due-set entry repaired");
                report.reindexed += 1;
            }
        }

        if state.next_due_at + overdue_after < now {
            warn!(job = %key, due_at = %state.next_due_at, "job overdue; queued for the next poll");
            report.overdue += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use scheduler_core::{Clock, ManualClock};
    use scheduler_store::MemoryStore;

    use super::*;
    use crate::lock::{Acquire, LockManager};
    use crate::recorder::MemorySink;
    use crate::registry::{handler_fn, JobDefaults, JobRegistry};
    use crate::retry::RetryPolicy;
    use crate::types::{JobDefinition, Outcome};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        keys: Keyspace,
        schedules: ScheduleStore,
        locks: LockManager,
        registry: JobRegistry,
    }

    fn fixture(definitions: Vec<JobDefinition>) -> Fixture {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let keys = Keyspace::new("t");
        let recorder = ExecutionRecorder::new(
            store.clone(),
            keys.clone(),
            StdDuration::from_secs(3_600),
            Arc::new(MemorySink::new()),
        );
        let mut registry = JobRegistry::new(JobDefaults::default());
        for def in definitions {
            registry.register(def, handler_fn(|_| async { Ok(()) })).unwrap();
        }
        Fixture {
            schedules: ScheduleStore::new(store.clone(), keys.clone(), recorder),
            locks: LockManager::new(store.clone(), keys.clone(), clock.clone()),
            clock,
            store,
            keys,
            registry,
        }
    }

    fn result(outcome: Outcome, at: DateTime<Utc>) -> LastResult {
        LastResult {
            outcome,
            attempt: 1,
            started_at: at,
            finished_at: at,
            duration_ms: 0,
            instance_id: "a".into(),
        }
    }

    async fn lease(f: &Fixture, job: &str) -> (Lease, JobState) {
        match f.locks.try_acquire(job, "a", StdDuration::from_secs(30)).await.unwrap() {
            Acquire::Granted { lease, state } => (lease, state),
            Acquire::Denied => panic!("expected lease"),
        }
    }

    #[tokio::test]
    async fn registration_is_idempotent_across_instances() {
        let f = fixture(vec![JobDefinition::interval("tick", StdDuration::from_secs(60))]);
        let job = f.registry.resolve("tick").unwrap();

        let first = f.schedules.register(&job, f.clock.now()).await.unwrap();
        assert_eq!(first, Registration::Created { due_at: f.clock.now() });

        f.clock.advance(chrono::Duration::seconds(5));
        assert_eq!(f.schedules.register(&job, f.clock.now()).await.unwrap(), Registration::Existing);
        // The original due time is kept.
        let state = f.schedules.load("tick").await.unwrap().unwrap().state;
        assert_eq!(state.next_due_at.timestamp(), 0);
    }

    #[tokio::test]
    async fn due_jobs_orders_by_time_then_key() {
        let base = DateTime::<Utc>::UNIX_EPOCH;
        let f = fixture(vec![
            JobDefinition::once("b-job", base + chrono::Duration::seconds(10)),
            JobDefinition::once("a-job", base + chrono::Duration::seconds(10)),
            JobDefinition::once("early", base + chrono::Duration::seconds(1)),
            JobDefinition::once("future", base + chrono::Duration::seconds(100)),
        ]);
        for job in f.registry.jobs() {
            f.schedules.register(&job, f.clock.now()).await.unwrap();
        }

        f.clock.advance(chrono::Duration::seconds(10));
        let due = f.schedules.due_jobs(f.clock.now(), 10).await.unwrap();
        assert_eq!(due, vec!["early", "a-job", "b-job"]);
    }

    #[tokio::test]
    async fn interval_reschedules_from_due_time() {
        let f = fixture(vec![
            JobDefinition::interval("report-daily", StdDuration::from_secs(86_400))
                .anchored_at(DateTime::<Utc>::UNIX_EPOCH),
        ]);
        let job = f.registry.resolve("report-daily").unwrap();
        f.schedules.register(&job, f.clock.now()).await.unwrap();

        f.clock.advance(chrono::Duration::seconds(7));
        let (lease, state) = lease(&f, "report-daily").await;
        let now = f.clock.now();
        let next = f
            .schedules
            .schedule_next(&lease, &job, &state, &result(Outcome::Succeeded, now), now, true)
            .await
            .unwrap();
        assert_eq!(next.map(|d| d.timestamp()), Some(86_400));

        let stored = f.schedules.load("report-daily").await.unwrap().unwrap().state;
        assert_eq!(stored.status, JobStatus::Idle);
        assert!(stored.lease_owner.is_none());
        assert_eq!(stored.last_result.unwrap().outcome, Outcome::Succeeded);
        assert_eq!(
            f.store.score(&f.keys.due_set(), "report-daily").await.unwrap(),
            Some(86_400_000)
        );
        assert!(f.store.get_value(&f.keys.lease("report-daily")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finished_one_shot_is_retired_and_not_recreated() {
        let f = fixture(vec![JobDefinition::once("once", DateTime::<Utc>::UNIX_EPOCH)]);
        let job = f.registry.resolve("once").unwrap();
        f.schedules.register(&job, f.clock.now()).await.unwrap();

        let (lease, state) = lease(&f, "once").await;
        let now = f.clock.now();
        let next = f
            .schedules
            .schedule_next(&lease, &job, &state, &result(Outcome::Succeeded, now), now, true)
            .await
            .unwrap();
        assert_eq!(next, None);
        assert!(f.schedules.load("once").await.unwrap().is_none());
        assert!(f.schedules.due_jobs(now, 10).await.unwrap().is_empty());

        assert_eq!(f.schedules.register(&job, now).await.unwrap(), Registration::Retired);
    }

    #[tokio::test]
    async fn stale_lease_cannot_commit() {
        let f = fixture(vec![JobDefinition::interval("tick", StdDuration::from_secs(60))
            .with_retry(RetryPolicy::none())]);
        let job = f.registry.resolve("tick").unwrap();
        f.schedules.register(&job, f.clock.now()).await.unwrap();

        let (stale, state) = lease(&f, "tick").await;
        f.clock.advance(chrono::Duration::seconds(31));
        let _fresh = lease(&f, "tick").await;

        let now = f.clock.now();
        let err = f
            .schedules
            .schedule_next(&stale, &job, &state, &result(Outcome::Succeeded, now), now, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn recovery_resets_orphaned_lease() {
        let f = fixture(vec![JobDefinition::interval("tick", StdDuration::from_secs(60))]);
        let job = f.registry.resolve("tick").unwrap();
        f.schedules.register(&job, f.clock.now()).await.unwrap();
        lease(&f, "tick").await;

        // Holder crashes; lease still live, nothing to do yet.
        let report = f
            .schedules
            .recover(&f.registry.jobs(), f.clock.now(), StdDuration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.reset, 0);

        f.clock.advance(chrono::Duration::seconds(30));
        let report = f
            .schedules
            .recover(&f.registry.jobs(), f.clock.now(), StdDuration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.reset, 1);

        let state = f.schedules.load("tick").await.unwrap().unwrap().state;
        assert_eq!(state.status, JobStatus::Idle);
        assert_eq!(state.next_due_at.timestamp(), 0);
    }

    #[tokio::test]
    async fn recovery_repairs_due_set_and_reports_overdue() {
        let f = fixture(vec![JobDefinition::interval("tick", StdDuration::from_secs(60))]);
        let job = f.registry.resolve("tick").unwrap();
        f.schedules.register(&job, f.clock.now()).await.unwrap();
        f.store
            .commit(Transaction::new().write(Write::ZRem {
                set: f.keys.due_set(),
                member: "tick".into(),
            }))
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::seconds(120));
        let report = f
            .schedules
            .recover(&f.registry.jobs(), f.clock.now(), StdDuration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.reindexed, 1);
        assert_eq!(report.overdue, 1);
        assert_eq!(f.schedules.due_jobs(f.clock.now(), 10).await.unwrap(), vec!["tick"]);
    }

    #[tokio::test]
    async fn mark_removed_skips_leased_jobs() {
        let f = fixture(vec![JobDefinition::interval("tick", StdDuration::from_secs(60))]);
        let job = f.registry.resolve("tick").unwrap();
        f.schedules.register(&job, f.clock.now()).await.unwrap();

        let (lease, _) = lease(&f, "tick").await;
        assert!(!f.schedules.mark_removed("tick", JobStatus::Failed).await.unwrap());

        f.locks.release(&lease).await.unwrap();
        assert!(f.schedules.mark_removed("tick", JobStatus::Failed).await.unwrap());
        assert!(f.schedules.load("tick").await.unwrap().is_none());
        assert_eq!(f.schedules.register(&job, f.clock.now()).await.unwrap(), Registration::Retired);
    }
}
