//! Execution Result Recorder: persists the last outcome of each job and
//! emits one record per attempt to a pluggable sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use scheduler_store::{Store, Write};
use tracing::{info, warn};

use crate::error::Result;
use crate::keys::Keyspace;
use crate::types::{ExecutionRecord, LastResult};

/// Receives one [`ExecutionRecord`] per attempt (metrics, logs, audit).
/// Must not block: called inline on the execution path.
pub trait ExecutionSink: Send + Sync {
    fn record(&self, record: &ExecutionRecord);
}

/// Default sink: one structured log line per attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ExecutionSink for TracingSink {
    fn record(&self, record: &ExecutionRecord) {
        let duration_ms = record.duration.as_millis() as u64;
        if record.discarded {
            warn!(
                job = %record.job_key,
                attempt = record.attempt,
                instance = %record.instance_id,
                outcome = %record.outcome,
                duration_ms,
                "execution result discarded (lease lost)"
            );
        } else {
            info!(
                job = %record.job_key,
                attempt = record.attempt,
                instance = %record.instance_id,
                outcome = %record.outcome,
                duration_ms,
                "job execution finished"
            );
        }
    }
}

/// Collects records in memory; handy for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ExecutionSink for MemorySink {
    fn record(&self, record: &ExecutionRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}

#[derive(Clone)]
pub struct ExecutionRecorder {
    store: Arc<dyn Store>,
    keys: Keyspace,
    retention: Duration,
    sink: Arc<dyn ExecutionSink>,
}

impl ExecutionRecorder {
    pub fn new(
        store: Arc<dyn Store>,
        keys: Keyspace,
        retention: Duration,
        sink: Arc<dyn ExecutionSink>,
    ) -> Self {
        Self {
            store,
            keys,
            retention,
            sink,
        }
    }

    /// Write that persists `result`; committed together with the reschedule
    /// so a fenced-out attempt leaves no trace.
    pub fn result_write(&self, job_key: &str, result: &LastResult) -> Result<Write> {
        Ok(Write::SetWithTtl {
            key: self.keys.result(job_key),
            value: serde_json::to_string(result)?,
            ttl: self.retention,
        })
    }

    /// Most recent committed result, if still within retention.
    pub async fn last_result(&self, job_key: &str) -> Result<Option<LastResult>> {
        match self.store.get_value(&self.keys.result(job_key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn emit(&self, record: &ExecutionRecord) {
        self.sink.record(record);
    }
}
