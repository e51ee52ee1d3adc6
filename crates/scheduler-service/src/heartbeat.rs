//! Built-in liveness job: writes `{ns}:heartbeat` and reads it back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_engine::{HandlerError, JobContext, JobDefinition, JobHandler, Keyspace};
use scheduler_store::Store;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const JOB_KEY: &str = "scheduler-heartbeat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beat {
    pub at: DateTime<Utc>,
    pub instance: String,
}

pub struct Heartbeat {
    store: Arc<dyn Store>,
    key: String,
    instance: String,
    ttl: Duration,
}

impl Heartbeat {
    pub fn new(store: Arc<dyn Store>, keys: &Keyspace, instance: impl Into<String>, interval: Duration) -> Self {
        Self {
            store,
            key: keys.heartbeat(),
            instance: instance.into(),
            ttl: interval * 3,
        }
    }

    pub fn definition(interval: Duration) -> JobDefinition {
        JobDefinition::interval(JOB_KEY, interval).with_timeout(Duration::from_secs(10))
    }
}

#[async_trait]
impl JobHandler for Heartbeat {
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let beat = Beat {
            at: Utc::now(),
            instance: self.instance.clone(),
        };
        let raw = serde_json::to_string(&beat).map_err(|e| HandlerError::new(e.to_string()))?;
        self.store
            .set_with_ttl(&self.key, raw, self.ttl)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))?;

        let stored = self
            .store
            .get_value(&self.key)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))?
            .ok_or_else(|| HandlerError::new("heartbeat vanished right after write"))?;
        let read: Beat = serde_json::from_str(&stored).map_err(|e| HandlerError::new(e.to_string()))?;
        // Another instance may have beaten us to it; only the write itself matters.
        debug!(attempt = ctx.attempt, at = %read.at, instance = %read.instance, "heartbeat written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use scheduler_store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx() -> JobContext {
        JobContext::new(JOB_KEY, 1, Utc::now(), CancellationToken::new())
    }

    #[tokio::test]
    async fn heartbeat_lands_in_namespaced_key() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let keys = Keyspace::new("svc");
        let beat = Heartbeat::new(store.clone(), &keys, "sched-1", Duration::from_secs(60));

        beat.run(ctx()).await.unwrap();

        let raw = store.get_value("{svc}:heartbeat").await.unwrap().unwrap();
        let read: Beat = serde_json::from_str(&raw).unwrap();
        assert_eq!(read.instance, "sched-1");
    }

    #[tokio::test]
    async fn store_outage_fails_the_attempt() {
        let memory = Arc::new(MemoryStore::new());
        memory.set_available(false);
        let beat = Heartbeat::new(memory, &Keyspace::new("svc"), "sched-1", Duration::from_secs(60));
        assert!(beat.run(ctx()).await.is_err());
    }
}
