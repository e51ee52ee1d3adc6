use std::time::Duration;

/// A precondition checked atomically before any write of a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Key does not exist (or its TTL has lapsed).
    Absent(String),
    /// Key exists.
    Present(String),
    /// Plain value at key equals the given string.
    Equals { key: String, value: String },
    /// Versioned document at key has this version; `None` means absent.
    Version { key: String, expected: Option<u64> },
}

impl Guard {
    pub fn key(&self) -> &str {
        match self {
            Guard::Absent(key) | Guard::Present(key) => key,
            Guard::Equals { key, .. } | Guard::Version { key, .. } => key,
        }
    }
}

/// A mutation applied only when every guard of its transaction holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Store a versioned document, bumping its version by one (first put = 1).
    Put { key: String, value: String },
    /// Remove a key of any kind.
    Delete { key: String },
    /// Plain value that the store expires on its own.
    SetWithTtl { key: String, value: String, ttl: Duration },
    /// Reset the TTL of an existing plain value.
    ExtendTtl { key: String, ttl: Duration },
    /// Add or move a member of a sorted set.
    ZAdd { set: String, member: String, score: i64 },
    /// Remove a member from a sorted set.
    ZRem { set: String, member: String },
}

impl Write {
    pub fn key(&self) -> &str {
        match self {
            Write::Put { key, .. }
            | Write::Delete { key }
            | Write::SetWithTtl { key, .. }
            | Write::ExtendTtl { key, .. } => key,
            Write::ZAdd { set, .. } | Write::ZRem { set, .. } => set,
        }
    }
}

/// Guards plus writes, applied as one store-side atomic step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    pub guards: Vec<Guard>,
    pub writes: Vec<Write>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn write(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }

    pub fn extend_writes(mut self, writes: impl IntoIterator<Item = Write>) -> Self {
        self.writes.extend(writes);
        self
    }
}

/// Result of [`crate::Store::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Applied,
    /// At least one guard failed; nothing was written.
    Conflict,
}

impl Commit {
    pub fn is_applied(self) -> bool {
        matches!(self, Commit::Applied)
    }
}

/// Result of [`crate::Store::extend_ttl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlExtension {
    Extended,
    Expired,
}

/// Versioned document as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: String,
}

/// TTLs are applied at millisecond granularity; never round a live TTL to 0.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
