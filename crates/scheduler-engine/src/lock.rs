//! Lock Manager: per-job leases with store-enforced expiry.
//!
//! A lease is a TTL key holding a unique token. Acquisition, renewal and
//! every state change made under a lease are guarded on that token *and* on
//! the state document version, so a holder whose lease lapsed can no longer
//! write anything. Correctness never depends on `release` being called.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scheduler_core::Clock;
use scheduler_store::{Commit, Guard, Store, Transaction, Write};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::keys::Keyspace;
use crate::store::read_state;
use crate::types::{JobState, JobStatus};

/// Lease length for a job: the configured default, or the job's timeout
/// plus a safety margin when that is longer.
pub fn lease_duration_for(timeout: Duration, default_lease: Duration, margin: Duration) -> Duration {
    default_lease.max(timeout + margin)
}

/// Proof of exclusive ownership of one job until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_key: String,
    pub owner: String,
    /// Unique per grant; reacquiring after expiry yields a different token.
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub duration: Duration,
    /// Version of the state document as last written under this lease.
    pub(crate) state_version: u64,
}

#[derive(Debug)]
pub enum Acquire {
    Granted { lease: Lease, state: JobState },
    /// Someone else holds it, or the job is no longer due.
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    Renewed,
    /// Expired and possibly reclaimed: stop and discard the result.
    Lost,
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn Store>,
    keys: Keyspace,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(store: Arc<dyn Store>, keys: Keyspace, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    /// Claim `job_key` for `instance_id` if it is due and unleased.
    pub async fn try_acquire(
        &self,
        job_key: &str,
        instance_id: &str,
        lease_duration: Duration,
    ) -> Result<Acquire> {
        let now = self.clock.now();
        let Some(snapshot) = read_state(self.store.as_ref(), &self.keys, job_key).await? else {
            return Ok(Acquire::Denied);
        };
        if !snapshot.state.is_due(now) {
            return Ok(Acquire::Denied);
        }

        let token = format!("{instance_id}/{}", Uuid::new_v4());
        let expires_at = now + to_chrono(lease_duration);
        let mut state = snapshot.state;
        state.status = JobStatus::Leased;
        state.lease_owner = Some(instance_id.to_string());
        state.lease_expires_at = Some(expires_at);

        let lease_key = self.keys.lease(job_key);
        let state_key = self.keys.state(job_key);
        let txn = Transaction::new()
            .guard(Guard::Absent(lease_key.clone()))
            .guard(Guard::Version {
                key: state_key.clone(),
                expected: Some(snapshot.version),
            })
            .write(Write::SetWithTtl {
                key: lease_key,
                value: token.clone(),
                ttl: lease_duration,
            })
            .write(Write::Put {
                key: state_key,
                value: state.to_json()?,
            });

        match self.store.commit(txn).await? {
            Commit::Applied => {
                debug!(job = %job_key, instance = %instance_id, "lease granted");
                Ok(Acquire::Granted {
                    lease: Lease {
                        job_key: job_key.to_string(),
                        owner: instance_id.to_string(),
                        token,
                        expires_at,
                        duration: lease_duration,
                        state_version: snapshot.version + 1,
                    },
                    state,
                })
            }
            Commit::Conflict => Ok(Acquire::Denied),
        }
    }

    /// Move a leased job to `running`. `None` if the lease is gone.
    pub async fn mark_running(&self, lease: &mut Lease, state: &JobState) -> Result<Option<JobState>> {
        let mut running = state.clone();
        running.status = JobStatus::Running;
        let txn = self
            .fenced(lease)
            .write(Write::Put {
                key: self.keys.state(&lease.job_key),
                value: running.to_json()?,
            });
        match self.store.commit(txn).await? {
            Commit::Applied => {
                lease.state_version += 1;
                Ok(Some(running))
            }
            Commit::Conflict => Ok(None),
        }
    }

    /// Extend the lease by its full duration from now.
    pub async fn renew(&self, lease: &mut Lease) -> Result<Renewal> {
        let now = self.clock.now();
        let Some(snapshot) = read_state(self.store.as_ref(), &self.keys, &lease.job_key).await? else {
            return Ok(Renewal::Lost);
        };
        if snapshot.version != lease.state_version {
            return Ok(Renewal::Lost);
        }

        let expires_at = now + to_chrono(lease.duration);
        let mut state = snapshot.state;
        state.lease_expires_at = Some(expires_at);
        let txn = self
            .fenced(lease)
            .write(Write::ExtendTtl {
                key: self.keys.lease(&lease.job_key),
                ttl: lease.duration,
            })
            .write(Write::Put {
                key: self.keys.state(&lease.job_key),
                value: state.to_json()?,
            });

        match self.store.commit(txn).await? {
            Commit::Applied => {
                lease.state_version += 1;
                lease.expires_at = expires_at;
                debug!(job = %lease.job_key, "lease renewed");
                Ok(Renewal::Renewed)
            }
            Commit::Conflict => Ok(Renewal::Lost),
        }
    }

    /// Drop the lease early. Returns false if it had already lapsed.
    pub async fn release(&self, lease: &Lease) -> Result<bool> {
        let lease_key = self.keys.lease(&lease.job_key);
        let mut txn = Transaction::new()
            .guard(Guard::Equals {
                key: lease_key.clone(),
                value: lease.token.clone(),
            })
            .write(Write::Delete { key: lease_key });

        // Clear the mirrored lease fields too, but only if nobody moved the state on.
        if let Some(snapshot) = read_state(self.store.as_ref(), &self.keys, &lease.job_key).await? {
            if snapshot.version == lease.state_version {
                let mut state = snapshot.state;
                state.status = JobStatus::Idle;
                state.lease_owner = None;
                state.lease_expires_at = None;
                let state_key = self.keys.state(&lease.job_key);
                txn = txn
                    .guard(Guard::Version {
                        key: state_key.clone(),
                        expected: Some(snapshot.version),
                    })
                    .write(Write::Put {
                        key: state_key,
                        value: state.to_json()?,
                    });
            }
        }
        Ok(self.store.commit(txn).await?.is_applied())
    }

    fn fenced(&self, lease: &Lease) -> Transaction {
        fenced(&self.keys, lease)
    }
}

/// Transaction guarded on still holding `lease` with an unchanged state.
pub(crate) fn fenced(keys: &Keyspace, lease: &Lease) -> Transaction {
    Transaction::new()
        .guard(Guard::Equals {
            key: keys.lease(&lease.job_key),
            value: lease.token.clone(),
        })
        .guard(Guard::Version {
            key: keys.state(&lease.job_key),
            expected: Some(lease.state_version),
        })
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
