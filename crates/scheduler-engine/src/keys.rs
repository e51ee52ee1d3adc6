/// Key layout inside the shared store.
///
/// The namespace is wrapped in braces so every key lands in the same Redis
/// Cluster hash slot, which multi-key scripts require.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(namespace: &str) -> Self {
        Self {
            prefix: format!("{{{namespace}}}"),
        }
    }

    /// Sorted set of job keys scored by due time (epoch ms).
    pub fn due_set(&self) -> String {
        format!("{}:due", self.prefix)
    }

    /// Versioned JSON `JobState`.
    pub fn state(&self, job: &str) -> String {
        format!("{}:job:{job}", self.prefix)
    }

    /// Lease token; expiry enforced by the store TTL.
    pub fn lease(&self, job: &str) -> String {
        format!("{}:lease:{job}", self.prefix)
    }

    /// Latest `LastResult`, kept for the retention window.
    pub fn result(&self, job: &str) -> String {
        format!("{}:result:{job}", self.prefix)
    }

    /// Final state of a one-shot job that will never run again.
    pub fn retired(&self, job: &str) -> String {
        format!("{}:retired:{job}", self.prefix)
    }

    pub fn heartbeat(&self) -> String {
        format!("{}:heartbeat", self.prefix)
    }
}
