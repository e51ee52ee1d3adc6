//! Job registry: maps job keys to their definition and handler.
//!
//! Populated once at startup by the host process; immutable afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::config::DispatchConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::retry::{Backoff, RetryPolicy};
use crate::types::JobDefinition;

/// Typed failure returned by a handler. Subject to the job's retry policy.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// What a handler gets for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_key: String,
    /// 1-based attempt number within the current occurrence.
    pub attempt: u32,
    /// The occurrence being executed.
    pub scheduled_for: DateTime<Utc>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_key: impl Into<String>,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_key: job_key.into(),
            attempt,
            scheduled_for,
            cancel,
        }
    }

    /// Set once the attempt timed out or the lease was lost. Handlers should
    /// stop promptly; their result is discarded either way.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Work run when a job fires. Implemented by the host application.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> std::result::Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn run(&self, ctx: JobContext) -> std::result::Result<(), HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Values applied to definitions that leave retry/timeout unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl From<&DispatchConfig> for JobDefaults {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            retry: RetryPolicy::new(
                config.default_max_retries,
                Backoff::new(
                    Duration::from_secs(config.retry_backoff_base_seconds),
                    Duration::from_secs(config.retry_backoff_cap_seconds),
                ),
            ),
            timeout: Duration::from_secs(config.default_timeout_seconds),
        }
    }
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

/// A job as resolved at registration: definition plus effective settings.
pub struct RegisteredJob {
    pub definition: JobDefinition,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub handler: Arc<dyn JobHandler>,
}

impl RegisteredJob {
    pub fn key(&self) -> &str {
        &self.definition.key
    }
}

impl std::fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("definition", &self.definition)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    defaults: JobDefaults,
    jobs: HashMap<String, Arc<RegisteredJob>>,
}

impl JobRegistry {
    pub fn new(defaults: JobDefaults) -> Self {
        Self {
            defaults,
            jobs: HashMap::new(),
        }
    }

    pub fn register(&mut self, definition: JobDefinition, handler: Arc<dyn JobHandler>) -> Result<()> {
        definition.validate()?;
        if self.jobs.contains_key(&definition.key) {
            return Err(SchedulerError::DuplicateJob {
                job: definition.key,
            });
        }
        let job = RegisteredJob {
            retry: definition.retry.unwrap_or(self.defaults.retry),
            timeout: definition.timeout.unwrap_or(self.defaults.timeout),
            definition,
            handler,
        };
        debug!(job = %job.key(), kind = job.definition.schedule.kind(), "job registered");
        self.jobs.insert(job.key().to_string(), Arc::new(job));
        Ok(())
    }

    /// Handler and settings for `key`; `UnknownJob` when this process has none.
    pub fn resolve(&self, key: &str) -> Result<Arc<RegisteredJob>> {
        self.jobs
            .get(key)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob {
                job: key.to_string(),
            })
    }

    /// Registered jobs in key order.
    pub fn jobs(&self) -> Vec<Arc<RegisteredJob>> {
        let mut jobs: Vec<_> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.key().cmp(b.key()));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn JobHandler> {
        handler_fn(|_ctx| async { Ok(()) })
    }

    #[test]
    fn resolve_unknown_key_fails() {
        let registry = JobRegistry::default();
        assert!(matches!(
            registry.resolve("ghost"),
            Err(SchedulerError::UnknownJob { job }) if job == "ghost"
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = JobRegistry::default();
        let def = JobDefinition::interval("tick", Duration::from_secs(60));
        registry.register(def.clone(), noop()).unwrap();

        assert!(matches!(
            registry.register(def, noop()),
            Err(SchedulerError::DuplicateJob { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unset_settings_take_registry_defaults() {
        let defaults = JobDefaults {
            retry: RetryPolicy::new(7, Backoff::new(Duration::from_secs(1), Duration::from_secs(2))),
            timeout: Duration::from_secs(9),
        };
        let mut registry = JobRegistry::new(defaults);
        registry
            .register(JobDefinition::interval("a", Duration::from_secs(60)), noop())
            .unwrap();
        registry
            .register(
                JobDefinition::interval("b", Duration::from_secs(60))
                    .with_retry(RetryPolicy::none())
                    .with_timeout(Duration::from_millis(250)),
                noop(),
            )
            .unwrap();

        let a = registry.resolve("a").unwrap();
        assert_eq!(a.retry.max_retries, 7);
        assert_eq!(a.timeout, Duration::from_secs(9));

        let b = registry.resolve("b").unwrap();
        assert_eq!(b.retry.max_retries, 0);
        assert_eq!(b.timeout, Duration::from_millis(250));

        let keys: Vec<_> = registry.jobs().iter().map(|j| j.key().to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn defaults_follow_dispatch_config() {
        let config = DispatchConfig {
            default_max_retries: 1,
            default_timeout_seconds: 3,
            ..DispatchConfig::default()
        };
        let defaults = JobDefaults::from(&config);
        assert_eq!(defaults.retry.max_retries, 1);
        assert_eq!(defaults.timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn closure_handler_receives_context() {
        let handler = handler_fn(|ctx: JobContext| async move {
            if ctx.attempt == 2 {
                Err(HandlerError::new(format!("{} failed", ctx.job_key)))
            } else {
                Ok(())
            }
        });
        let ctx = |attempt| JobContext::new("job", attempt, Utc::now(), CancellationToken::new());

        assert!(handler.run(ctx(1)).await.is_ok());
        assert_eq!(handler.run(ctx(2)).await.unwrap_err().to_string(), "job failed");
    }
}
