use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scheduler_core::{Clock, SchedulerConfig, SystemClock};
use scheduler_store::Store;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::keys::Keyspace;
use crate::lock::{lease_duration_for, Acquire, Lease, LockManager, Renewal};
use crate::recorder::{ExecutionRecorder, ExecutionSink, TracingSink};
use crate::registry::{JobContext, JobRegistry, RegisteredJob};
use crate::retry::POLL_BACKOFF;
use crate::store::{RecoveryReport, ScheduleStore};
use crate::types::{ExecutionRecord, JobState, LastResult, Outcome};

/// Smallest renewal period; keeps very short leases from spinning.
const MIN_RENEW_EVERY: Duration = Duration::from_millis(10);

struct Inner {
    instance_id: String,
    registry: JobRegistry,
    schedules: ScheduleStore,
    locks: LockManager,
    recorder: ExecutionRecorder,
    clock: Arc<dyn Clock>,
    workers: Arc<Semaphore>,
    poll_interval: Duration,
    recovery_interval: Duration,
    batch_size: usize,
    default_lease: Duration,
    lease_margin: Duration,
    /// Unknown job keys already reported at `warn`.
    unknown: Mutex<HashSet<String>>,
}

/// Dispatch loop for one scheduler instance.
///
/// Any number of engines (in one process or many) may run against the same
/// store; the store's guarded commits are the only coordination between them.
#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<Inner>,
}

pub struct EngineBuilder {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    registry: JobRegistry,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn ExecutionSink>>,
    instance_id: Option<String>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn build(self) -> SchedulerEngine {
        let dispatch = &self.config.dispatch;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let keys = Keyspace::new(&self.config.store.namespace);
        let recorder = ExecutionRecorder::new(
            self.store.clone(),
            keys.clone(),
            Duration::from_secs(self.config.store.result_retention_seconds),
            sink,
        );

        SchedulerEngine {
            inner: Arc::new(Inner {
                instance_id: self
                    .instance_id
                    .unwrap_or_else(|| dispatch.resolve_instance_id()),
                schedules: ScheduleStore::new(self.store.clone(), keys.clone(), recorder.clone()),
                locks: LockManager::new(self.store, keys, clock.clone()),
                recorder,
                clock,
                workers: Arc::new(Semaphore::new(dispatch.max_workers.max(1))),
                poll_interval: Duration::from_secs(dispatch.poll_interval_seconds.max(1)),
                recovery_interval: Duration::from_secs(dispatch.recovery_interval_seconds.max(1)),
                batch_size: dispatch.poll_batch_size.max(1),
                default_lease: Duration::from_secs(dispatch.default_lease_seconds),
                lease_margin: Duration::from_millis(dispatch.lease_margin_ms),
                registry: self.registry,
                unknown: Mutex::new(HashSet::new()),
            }),
        }
    }
}

impl SchedulerEngine {
    pub fn builder(config: SchedulerConfig, store: Arc<dyn Store>, registry: JobRegistry) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            registry,
            clock: None,
            sink: None,
            instance_id: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn schedules(&self) -> &ScheduleStore {
        &self.inner.schedules
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn recorder(&self) -> &ExecutionRecorder {
        &self.inner.recorder
    }

    /// Create missing job states, then repair anything a crashed instance
    /// left behind. Safe to run from every instance at once.
    pub async fn bootstrap(&self) -> Result<RecoveryReport> {
        let now = self.inner.clock.now();
        for job in self.inner.registry.jobs() {
            self.inner.schedules.register(&job, now).await?;
        }
        self.recover().await
    }

    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = self
            .inner
            .schedules
            .recover(&self.inner.registry.jobs(), self.inner.clock.now(), self.inner.poll_interval)
            .await?;
        if report != RecoveryReport::default() {
            info!(
                reset = report.reset,
                reindexed = report.reindexed,
                overdue = report.overdue,
                "recovery scan finished"
            );
        }
        Ok(report)
    }

    /// One poll: claim what is due and wait for every claimed execution to
    /// finish. Returns the number of jobs claimed.
    pub async fn run_cycle(&self) -> Result<usize> {
        let mut tasks = JoinSet::new();
        let claimed = self.claim_due(&mut tasks).await;
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }
        claimed
    }

    /// Main event loop. Polls until `shutdown` broadcasts `true`, then stops
    /// claiming and waits for in-flight executions.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance = %self.inner.instance_id,
            jobs = self.inner.registry.len(),
            workers = self.inner.workers.available_permits(),
            "scheduler engine started"
        );

        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.bootstrap().await {
                Ok(_) => break,
                Err(e) => {
                    failures += 1;
                    let delay = POLL_BACKOFF.delay(failures);
                    error!(error = %e, retry_in_ms = delay.as_millis() as u64, "scheduler bootstrap failed");
                    if pause(delay, &mut shutdown).await {
                        return;
                    }
                }
            }
        }

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut poll = tokio::time::interval(self.inner.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let recovery_every = self.inner.recovery_interval;
        let mut recovery = tokio::time::interval_at(Instant::now() + recovery_every, recovery_every);
        recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.claim_due(&mut tasks).await {
                        Ok(_) => failures = 0,
                        Err(e) if e.is_transient() => {
                            failures += 1;
                            let delay = POLL_BACKOFF.delay(failures);
                            error!(
                                error = %e,
                                failures,
                                retry_in_ms = delay.as_millis() as u64,
                                "store unavailable; no jobs will run until it recovers"
                            );
                            if pause(delay, &mut shutdown).await {
                                break;
                            }
                            poll.reset();
                        }
                        Err(e) => error!(error = %e, "scheduler poll error"),
                    }
                }
                _ = recovery.tick() => {
                    if let Err(e) = self.recover().await {
                        error!(error = %e, "recovery scan failed");
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => reap(joined),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "scheduler engine shutting down");
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }
        info!(instance = %self.inner.instance_id, "scheduler engine stopped");
    }

    /// Poll and claim. Claimed jobs are spawned onto `tasks`.
    ///
    /// Pages through the due set until `batch_size` claims were attempted, so
    /// keys this process cannot run (unknown or unreadable) never starve the
    /// ones it can. Only a store outage aborts the cycle.
    async fn claim_due(&self, tasks: &mut JoinSet<()>) -> Result<usize> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut claimed = 0;
        let mut attempted = 0;
        let mut offset = 0;

        'pages: loop {
            let page = inner.schedules.due_page(now, offset, inner.batch_size).await?;
            let fetched = page.len();
            offset += fetched;

            for key in page {
                let job = match inner.registry.resolve(&key) {
                    Ok(job) => job,
                    Err(e) => {
                        self.report_unknown(&key, &e);
                        continue;
                    }
                };
                let Ok(permit) = inner.workers.clone().try_acquire_owned() else {
                    debug!(job = %key, "worker pool saturated; remaining jobs wait for the next poll");
                    break 'pages;
                };

                let lease_duration = lease_duration_for(job.timeout, inner.default_lease, inner.lease_margin);
                match inner.locks.try_acquire(&key, &inner.instance_id, lease_duration).await {
                    Ok(Acquire::Granted { lease, state }) => {
                        claimed += 1;
                        let inner = Arc::clone(&self.inner);
                        tasks.spawn(async move {
                            let job_key = lease.job_key.clone();
                            if let Err(e) = execute(inner, job, lease, state, permit).await {
                                match e {
                                    SchedulerError::LeaseLost { .. } => warn!(job = %job_key, "{e}"),
                                    _ => error!(job = %job_key, error = %e, "job execution error"),
                                }
                            }
                        });
                    }
                    Ok(Acquire::Denied) => debug!(job = %key, "lease denied"),
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        error!(job = %key, error = %e, "cannot claim job; skipping");
                        continue;
                    }
                }

                attempted += 1;
                if attempted == inner.batch_size {
                    break 'pages;
                }
            }

            if fetched < inner.batch_size {
                break;
            }
        }
        Ok(claimed)
    }

    fn report_unknown(&self, key: &str, err: &SchedulerError) {
        let first = self
            .inner
            .unknown
            .lock()
            .map(|mut seen| seen.insert(key.to_string()))
            .unwrap_or(true);
        if first {
            warn!(job = %key, instance = %self.inner.instance_id, "{err}; skipping");
        } else {
            debug!(job = %key, "{err}; skipping");
        }
    }
}

/// Run one claimed job to completion and commit the outcome under its lease.
async fn execute(
    inner: Arc<Inner>,
    job: Arc<RegisteredJob>,
    mut lease: Lease,
    state: JobState,
    permit: OwnedSemaphorePermit,
) -> Result<()> {
    let key = job.key().to_string();
    let attempt = state.attempt_count + 1;
    let started_at = inner.clock.now();
    let started = Instant::now();

    let mut running = match inner.locks.mark_running(&mut lease, &state).await {
        Ok(Some(running)) => running,
        Ok(None) => return Err(SchedulerError::LeaseLost { job: key }),
        Err(e) => {
            if let Err(release_err) = inner.locks.release(&lease).await {
                warn!(job = %key, error = %release_err, "lease release failed; it will expire on its own");
            }
            return Err(e);
        }
    };

    // The permit travels with the handler task, so a handler that ignores
    // cancellation keeps its worker slot until it really returns.
    let cancel = CancellationToken::new();
    let ctx = JobContext::new(&key, attempt, running.scheduled_for, cancel.clone());
    let handler = Arc::clone(&job.handler);
    let mut task = tokio::spawn(async move {
        let _permit = permit;
        handler.run(ctx).await
    });

    let deadline = tokio::time::sleep(job.timeout);
    tokio::pin!(deadline);
    let renew_every = (lease.duration / 3).max(MIN_RENEW_EVERY);
    let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut lost = false;
    let outcome = loop {
        tokio::select! {
            joined = &mut task => break match joined {
                Ok(Ok(())) => Outcome::Succeeded,
                Ok(Err(e)) => Outcome::Failed { reason: e.to_string() },
                Err(e) => Outcome::Failed { reason: format!("handler panicked: {e}") },
            },
            _ = &mut deadline => {
                cancel.cancel();
                break Outcome::TimedOut;
            }
            _ = renew.tick() => match inner.locks.renew(&mut lease).await {
                Ok(Renewal::Renewed) => {}
                Ok(Renewal::Lost) => {
                    cancel.cancel();
                    lost = true;
                    break Outcome::Failed { reason: "lease lost".into() };
                }
                Err(e) => warn!(job = %key, error = %e, "lease renewal failed; retrying"),
            },
        }
    };

    let result = LastResult {
        outcome: outcome.clone(),
        attempt,
        started_at,
        finished_at: inner.clock.now(),
        duration_ms: started.elapsed().as_millis() as u64,
        instance_id: inner.instance_id.clone(),
    };
    if let Some(err) = outcome.as_error(&key, job.timeout) {
        warn!(job = %key, attempt, "{err}");
    }

    let committed = if lost {
        Err(SchedulerError::LeaseLost { job: key.clone() })
    } else {
        // A timed-out handler may still be running: keep the lease until its
        // TTL runs out so nobody else starts a second copy.
        running.lease_expires_at = Some(lease.expires_at);
        let release = outcome != Outcome::TimedOut;
        inner
            .schedules
            .schedule_next(&lease, &job, &running, &result, result.finished_at, release)
            .await
    };

    inner.recorder.emit(&ExecutionRecord {
        job_key: key.clone(),
        attempt,
        instance_id: inner.instance_id.clone(),
        outcome,
        duration: started.elapsed(),
        discarded: committed.is_err(),
    });

    let next_due_at = committed?;
    debug!(job = %key, next_due_at = ?next_due_at, "job rescheduled");
    Ok(())
}

fn reap(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "job execution task panicked");
    }
}

/// Sleep for `delay` unless shutdown arrives first. True means stop.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
