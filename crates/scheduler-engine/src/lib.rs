//! `scheduler-engine` — distributed job scheduler over a shared Redis-compatible store.
//!
//! # Overview
//!
//! Each process registers its jobs in a [`JobRegistry`] and runs a
//! [`SchedulerEngine`]. Engines poll the due set, claim jobs with TTL leases,
//! run handlers on a bounded worker pool and commit the outcome together with
//! the next due time in one guarded store transaction. Any number of engines
//! may share a store; each due occurrence runs on exactly one of them.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                                   |
//! |------------|-------------------------------------------------------------|
//! | `Once`     | Single fire at an absolute UTC instant, then retired        |
//! | `Interval` | Every N seconds on a fixed grid; missed slots coalesce      |
//! | `Cron`     | Five- or six-field cron expression, UTC, next fire after now |

pub mod engine;
pub mod error;
pub mod keys;
pub mod lock;
pub mod recorder;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{EngineBuilder, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use keys::Keyspace;
pub use lock::{Acquire, Lease, LockManager, Renewal};
pub use recorder::{ExecutionRecorder, ExecutionSink, MemorySink, TracingSink};
pub use registry::{handler_fn, HandlerError, JobContext, JobDefaults, JobHandler, JobRegistry, RegisteredJob};
pub use retry::{Backoff, RetryPolicy};
pub use store::{RecoveryReport, Registration, ScheduleStore, StateSnapshot};
pub use types::{ExecutionRecord, JobDefinition, JobState, JobStatus, LastResult, Outcome, Schedule};
